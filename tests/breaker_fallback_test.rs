//! Guarded dependencies failing, timing out, tripping their breaker or
//! being forced open, and what the purchase does in each case.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::*;
use http::StatusCode;
use purchase_gateway::{
    circuit_breaker::{CircuitBreakerConfig, CircuitState},
    models::{BillerName, PurchaseProcessState},
    services::{
        bin_routing, fraud_recommendation,
        payment_template::{self, PaymentTemplateError},
        purchase::{PaymentMethod, PurchaseOutcome},
    },
    ServiceError,
};
use rstest::rstest;
use uuid::Uuid;

#[rstest]
#[case::failing(FraudBehaviour::Failing, "failure")]
#[case::hanging(FraudBehaviour::Hanging, "timeout")]
#[tokio::test]
async fn unavailable_fraud_service_allows_the_purchase(
    #[case] behaviour: FraudBehaviour,
    #[case] reason: &str,
) {
    let harness = Harness::builder().fraud_behaviour(behaviour).build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(init.state, PurchaseProcessState::Valid);
    assert!(!init.captcha_required);

    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(result.outcome, PurchaseOutcome::Approved);
    assert_eq!(harness.fraud.calls(), 2);
    assert_eq!(
        harness
            .metrics
            .fallbacks(fraud_recommendation::COMMAND_NAME, reason),
        2
    );
}

#[tokio::test]
async fn kill_switch_skips_the_fraud_service() {
    let harness = Harness::builder().fraud(vec![block()], vec![block()]).build();
    harness
        .kill_switch
        .force_open(fraud_recommendation::COMMAND_NAME);

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(init.state, PurchaseProcessState::Valid);
    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();

    assert_eq!(result.outcome, PurchaseOutcome::Approved);
    assert_eq!(harness.fraud.calls(), 0);
    assert_eq!(
        harness
            .metrics
            .fallbacks(fraud_recommendation::COMMAND_NAME, "forced_open"),
        2
    );
}

#[tokio::test]
async fn released_kill_switch_screens_again() {
    let harness = Harness::builder().fraud(vec![block()], vec![allow()]).build();
    harness
        .kill_switch
        .force_open(fraud_recommendation::COMMAND_NAME);
    let first = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(first.state, PurchaseProcessState::Valid);

    harness
        .kill_switch
        .release(fraud_recommendation::COMMAND_NAME);
    let second = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(second.state, PurchaseProcessState::BlockedDueToFraudAdvice);
    assert_eq!(harness.fraud.calls(), 1);
}

#[tokio::test]
async fn repeated_failures_open_the_fraud_circuit() {
    let harness = Harness::builder()
        .fraud_behaviour(FraudBehaviour::Failing)
        .breaker_config(CircuitBreakerConfig {
            rolling_window_size: 4,
            request_volume_threshold: 2,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(60),
            success_threshold: 1,
        })
        .build();

    let first = harness.service.init_purchase(init_request()).await.unwrap();
    harness
        .service
        .process_purchase(process_request(first.session_id, card()))
        .await
        .unwrap();
    assert_eq!(
        harness
            .breakers
            .get(fraud_recommendation::COMMAND_NAME)
            .state(),
        CircuitState::Open
    );

    let second = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(second.state, PurchaseProcessState::Valid);
    assert_eq!(harness.fraud.calls(), 2);
    assert_eq!(
        harness
            .metrics
            .fallbacks(fraud_recommendation::COMMAND_NAME, "circuit_open"),
        1
    );
}

#[tokio::test]
async fn template_service_outage_fails_the_stored_card_payment() {
    let harness = Harness::builder()
        .templates(FakeTemplateService::down())
        .build();

    let mut request = init_request();
    request.member_id = Some(Uuid::new_v4());
    let init = harness.service.init_purchase(request).await.unwrap();
    // listing degrades to no saved cards
    assert!(init.payment_templates.is_empty());
    assert_eq!(
        harness
            .metrics
            .fallbacks(payment_template::RETRIEVE_ALL_COMMAND, "failure"),
        1
    );

    let err = harness
        .service
        .process_purchase(process_request(
            init.session_id,
            PaymentMethod::Template {
                template_id: Uuid::new_v4(),
                last_four: Some("1111".into()),
            },
        ))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::PaymentTemplate(PaymentTemplateError::UnableToRetrieve { .. })
    );
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    assert_eq!(err.response_message(), "Payment template service unavailable");
    assert!(harness
        .gateway(BillerName::Rocketgate)
        .charge_requests()
        .is_empty());

    let untouched = harness.service.purchase(init.session_id).await.unwrap();
    assert_eq!(untouched.state, PurchaseProcessState::Valid);
    assert_eq!(untouched.gateway_submit_number, 0);
}

#[tokio::test]
async fn forced_open_template_validation_is_service_unavailable() {
    let harness = Harness::builder().build();
    harness
        .kill_switch
        .force_open(payment_template::VALIDATE_COMMAND);
    let init = harness.service.init_purchase(init_request()).await.unwrap();

    let err = harness
        .service
        .process_purchase(process_request(
            init.session_id,
            PaymentMethod::Template {
                template_id: Uuid::new_v4(),
                last_four: Some("1111".into()),
            },
        ))
        .await
        .unwrap_err();

    assert_matches!(
        err,
        ServiceError::CircuitBreakerOpen(payment_template::VALIDATE_COMMAND)
    );
    assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.response_message(), "Service temporarily unavailable");
    assert!(harness
        .gateway(BillerName::Rocketgate)
        .charge_requests()
        .is_empty());

    let untouched = harness.service.purchase(init.session_id).await.unwrap();
    assert_eq!(untouched.state, PurchaseProcessState::Valid);
}

#[tokio::test]
async fn unknown_template_is_a_caller_error() {
    let harness = Harness::builder().build();
    let init = harness.service.init_purchase(init_request()).await.unwrap();

    let err = harness
        .service
        .process_purchase(process_request(
            init.session_id,
            PaymentMethod::Template {
                template_id: Uuid::new_v4(),
                last_four: Some("1111".into()),
            },
        ))
        .await
        .unwrap_err();

    assert_matches!(err, ServiceError::PaymentTemplate(PaymentTemplateError::NotFound(_)));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    // rejections never count against the circuit
    assert_eq!(
        harness
            .breakers
            .get(payment_template::VALIDATE_COMMAND)
            .state(),
        CircuitState::Closed
    );
    assert_eq!(
        harness
            .metrics
            .fallbacks(payment_template::VALIDATE_COMMAND, "failure"),
        0
    );
}

#[tokio::test]
async fn bin_routing_outage_charges_without_a_routing_code() {
    let harness = Harness::builder().routing(FakeBinRouting::down()).build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();

    assert_eq!(result.outcome, PurchaseOutcome::Approved);
    let charges = harness.gateway(BillerName::Rocketgate).charge_requests();
    assert_eq!(charges.len(), 1);
    assert!(charges[0].routing_code.is_none());
    assert_eq!(harness.routing.requests().len(), 1);
    assert_eq!(
        harness
            .metrics
            .fallbacks(bin_routing::COMMAND_NAME, "failure"),
        1
    );
}
