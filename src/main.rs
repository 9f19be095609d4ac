use std::{collections::HashMap, fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tracing::{error, info};
use uuid::Uuid;

use purchase_gateway::{
    config,
    errors::{ErrorResponse, ServiceError},
    events::{process_events, EventHandler, EventSender, LoggingEventHandler},
    models::{
        values::LastFour, BillerName, CaptchaStep, FraudRecommendation, PurchaseProcessState,
        SessionId, StateAction, TransactionState,
    },
    services::{
        bin_routing::{BinRoutingCode, BinRoutingError, BinRoutingRequest, BinRoutingServiceClient},
        biller::{ChargeOutcome, SimulatedBillerGateway},
        factory::{DependencyClients, ServiceFactory},
        fraud_recommendation::{
            FraudEvent, FraudRecommendationError, FraudRecommendationRequest, FraudServiceClient,
        },
        payment_template::{PaymentTemplate, PaymentTemplateError, PaymentTemplateServiceClient},
        purchase::{
            CompleteThirdPartyRequest, InitPurchaseRequest, InitPurchaseResult, PaymentMethod,
            ProcessPurchaseRequest, PurchaseOutcome, PurchaseResult, PurchaseService,
        },
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    match cli.command {
        Commands::Simulate(args) => handle_simulate(cfg, args).await?,
        Commands::States => handle_states(cli.json)?,
    }

    Ok(())
}

#[derive(Parser)]
#[command(
    name = "purchase-gateway",
    about = "Purchase gateway: scripted purchase simulations and lifecycle inspection",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON when available"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted purchase against in-memory dependencies
    Simulate(SimulateArgs),
    /// Print the purchase process transition table
    States,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(long, help = "Path to the JSON scenario")]
    file: PathBuf,
}

/// A purchase from init to settlement, with every dependency answer scripted.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Scenario {
    init: InitPurchaseRequest,
    #[serde(default)]
    fraud: FraudScript,
    #[serde(default)]
    billers: HashMap<BillerName, BillerScript>,
    #[serde(default)]
    payment_templates: Vec<PaymentTemplate>,
    /// Captcha answers, applied as soon as the purchase asks for them
    #[serde(default)]
    captcha: Vec<CaptchaStep>,
    process: ProcessStep,
    #[serde(default)]
    three_d_pares: Option<String>,
    #[serde(default)]
    third_party_outcome: Option<TransactionState>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FraudScript {
    #[serde(default)]
    init: Vec<FraudRecommendation>,
    #[serde(default)]
    process: Vec<FraudRecommendation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BillerScript {
    #[serde(default)]
    charges: Vec<ChargeOutcome>,
    #[serde(default)]
    three_d_completions: Vec<ChargeOutcome>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessStep {
    payment: PaymentMethod,
    #[serde(default)]
    select_all_cross_sales: bool,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    return_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    init: InitPurchaseResult,
    steps: Vec<PurchaseResult>,
    metrics: String,
}

#[derive(Debug, Serialize)]
struct TransitionRow {
    from: PurchaseProcessState,
    action: String,
    to: PurchaseProcessState,
}

struct ScriptedFraudClient {
    script: FraudScript,
}

#[async_trait]
impl FraudServiceClient for ScriptedFraudClient {
    async fn retrieve(
        &self,
        request: &FraudRecommendationRequest,
    ) -> Result<Vec<FraudRecommendation>, FraudRecommendationError> {
        Ok(match request.event {
            FraudEvent::InitCustomer => self.script.init.clone(),
            FraudEvent::ProcessCustomer => self.script.process.clone(),
        })
    }
}

struct ScriptedTemplateClient {
    templates: Vec<PaymentTemplate>,
}

impl ScriptedTemplateClient {
    fn find(&self, template_id: Uuid) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.templates
            .iter()
            .find(|t| t.template_id == template_id)
            .cloned()
            .ok_or(PaymentTemplateError::NotFound(template_id))
    }
}

#[async_trait]
impl PaymentTemplateServiceClient for ScriptedTemplateClient {
    async fn retrieve_all(
        &self,
        member_id: Uuid,
        _payment_type: &str,
        _session_id: SessionId,
    ) -> Result<Vec<PaymentTemplate>, PaymentTemplateError> {
        Ok(self
            .templates
            .iter()
            .filter(|t| t.member_id == member_id)
            .cloned()
            .collect())
    }

    async fn retrieve(
        &self,
        template_id: Uuid,
        _session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.find(template_id)
    }

    async fn validate(
        &self,
        template_id: Uuid,
        last_four: &LastFour,
        _session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        let template = self.find(template_id)?;
        if template.last_four != *last_four {
            return Err(PaymentTemplateError::ValidationFailed(template_id));
        }
        Ok(template)
    }
}

struct NoRoutingCodes;

#[async_trait]
impl BinRoutingServiceClient for NoRoutingCodes {
    async fn retrieve(
        &self,
        _request: &BinRoutingRequest,
    ) -> Result<Vec<BinRoutingCode>, BinRoutingError> {
        Ok(Vec::new())
    }
}

async fn handle_simulate(cfg: config::AppConfig, args: SimulateArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read scenario {}", args.file.display()))?;
    let scenario: Scenario = serde_json::from_str(&raw)
        .with_context(|| format!("invalid scenario {}", args.file.display()))?;

    let (event_sender, event_rx) = EventSender::channel(cfg.event_channel_capacity);
    let handlers: Vec<Arc<dyn EventHandler>> = vec![Arc::new(LoggingEventHandler)];
    let worker = tokio::spawn(process_events(event_rx, handlers));

    let factory = ServiceFactory::from_config(cfg)
        .context("failed to wire the purchase service")?
        .with_event_sender(event_sender);

    let mut scripts = scenario.billers;
    let mut billers = factory.biller_registry();
    for name in BillerName::iter().filter(|name| *name != BillerName::Unknown) {
        let script = scripts.remove(&name).unwrap_or_default();
        billers.register(Arc::new(
            SimulatedBillerGateway::new(name)
                .with_charges(script.charges)
                .with_three_d_completions(script.three_d_completions),
        ));
    }
    let clients = DependencyClients {
        fraud: Arc::new(ScriptedFraudClient {
            script: scenario.fraud,
        }),
        payment_templates: Arc::new(ScriptedTemplateClient {
            templates: scenario.payment_templates,
        }),
        bin_routing: Arc::new(NoRoutingCodes),
    };
    let service = factory.purchase_service(clients, billers);

    let outcome = run_scenario(
        &service,
        scenario.init,
        scenario.process,
        &scenario.captcha,
        scenario.three_d_pares,
        scenario.third_party_outcome,
    )
    .await;
    let metrics = factory.metrics().summary();

    // close the event channel so the consumer drains and stops
    drop(service);
    drop(factory);
    if let Err(e) = worker.await {
        error!(error = %e, "event consumer stopped unexpectedly");
    }

    match outcome {
        Ok((init, steps)) => print_json(&SimulationReport {
            init,
            steps,
            metrics,
        }),
        Err(e) => {
            error!(error = %e, "simulation failed");
            eprintln!("{}", serde_json::to_string_pretty(&ErrorResponse::from(&e))?);
            std::process::exit(1);
        }
    }
}

async fn run_scenario(
    service: &PurchaseService,
    init_request: InitPurchaseRequest,
    step: ProcessStep,
    captcha: &[CaptchaStep],
    three_d_pares: Option<String>,
    third_party_outcome: Option<TransactionState>,
) -> Result<(InitPurchaseResult, Vec<PurchaseResult>), ServiceError> {
    let business_group_id = init_request.business_group_id;
    let init = service.init_purchase(init_request).await?;
    let session_id = init.session_id;
    info!(%session_id, state = %init.state, "scenario initialized");

    if init.captcha_required && captcha.contains(&CaptchaStep::Init) {
        service.validate_captcha(session_id, CaptchaStep::Init).await?;
    }

    let request = ProcessPurchaseRequest {
        session_id,
        business_group_id,
        payment: step.payment,
        selected_cross_sales: if step.select_all_cross_sales {
            init.cross_sale_item_ids.clone()
        } else {
            Vec::new()
        },
        country: step.country,
        return_url: step.return_url,
    };

    let mut steps = vec![service.process_purchase(request.clone()).await?];
    if matches!(
        last_outcome(&steps),
        Some(PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: true
        })
    ) && captcha.contains(&CaptchaStep::Process)
    {
        service
            .validate_captcha(session_id, CaptchaStep::Process)
            .await?;
        steps.push(service.process_purchase(request).await?);
    }

    match (last_outcome(&steps), three_d_pares, third_party_outcome) {
        (Some(PurchaseOutcome::ThreeDSecureRequired { .. }), Some(pares), _) => {
            steps.push(service.complete_three_d(session_id, pares).await?);
        }
        (
            Some(PurchaseOutcome::RedirectRequired { .. } | PurchaseOutcome::Pending),
            _,
            Some(outcome),
        ) => {
            steps.push(
                service
                    .complete_third_party(CompleteThirdPartyRequest {
                        session_id,
                        outcome,
                    })
                    .await?,
            );
        }
        _ => {}
    }

    Ok((init, steps))
}

fn last_outcome(steps: &[PurchaseResult]) -> Option<&PurchaseOutcome> {
    steps.last().map(|result| &result.outcome)
}

fn handle_states(json: bool) -> Result<()> {
    let rows: Vec<TransitionRow> = PurchaseProcessState::iter()
        .flat_map(|from| {
            StateAction::iter().filter_map(move |action| {
                from.apply(action).ok().map(|to| TransitionRow {
                    from,
                    action: action.to_string(),
                    to,
                })
            })
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    for row in rows {
        println!(
            "{:<26} {:<28} -> {}",
            row.from.as_ref(),
            row.action,
            row.to
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
