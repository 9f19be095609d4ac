//! Fraud screening and captcha challenges around a purchase.

mod common;

use assert_matches::assert_matches;
use common::*;
use http::StatusCode;
use purchase_gateway::{
    errors::ErrorResponse,
    models::{fraud_advice::FraudAdviceError, BillerName, CaptchaStep, PurchaseProcessState},
    services::{fraud_recommendation::FraudEvent, purchase::PurchaseOutcome},
    ServiceError,
};

#[tokio::test]
async fn init_captcha_unblocks_the_purchase() {
    let harness = Harness::builder()
        .fraud(vec![captcha()], vec![allow()])
        .build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(init.state, PurchaseProcessState::BlockedDueToFraudAdvice);
    assert!(init.captcha_required);

    let blocked = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(
        blocked.outcome,
        PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: true
        }
    );
    assert!(harness
        .gateway(BillerName::Rocketgate)
        .charge_requests()
        .is_empty());

    let cleared = harness
        .service
        .validate_captcha(init.session_id, CaptchaStep::Init)
        .await
        .unwrap();
    assert_eq!(cleared.state, PurchaseProcessState::Valid);
    assert_eq!(cleared.outcome, PurchaseOutcome::ReadyToProcess);

    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(result.outcome, PurchaseOutcome::Approved);
    assert_eq!(harness.metrics.captchas_validated.get(), 1);
    assert_eq!(
        harness.fraud.events(),
        vec![FraudEvent::InitCustomer, FraudEvent::ProcessCustomer]
    );
}

#[tokio::test]
async fn hard_block_at_init_has_no_captcha_way_out() {
    let harness = Harness::builder().fraud(vec![block()], vec![allow()]).build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(init.state, PurchaseProcessState::BlockedDueToFraudAdvice);
    assert!(!init.captcha_required);

    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(
        result.outcome,
        PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: false
        }
    );
    // blocked purchases are not screened again
    assert_eq!(harness.fraud.calls(), 1);
    assert_eq!(harness.metrics.purchases_blocked.get(), 1);

    let err = harness
        .service
        .validate_captcha(init.session_id, CaptchaStep::Init)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::FraudAdvice(FraudAdviceError::InitCaptchaNotAdvised)
    );
}

#[tokio::test]
async fn process_captcha_cannot_precede_the_init_captcha() {
    let harness = Harness::builder()
        .fraud(vec![allow()], vec![captcha()])
        .build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    assert_eq!(init.state, PurchaseProcessState::Valid);

    let blocked = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(blocked.state, PurchaseProcessState::BlockedDueToFraudAdvice);

    let err = harness
        .service
        .validate_captcha(init.session_id, CaptchaStep::Process)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::FraudAdvice(FraudAdviceError::ProcessCaptchaBeforeInitCaptcha)
    );
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    let body = ErrorResponse::from(&err);
    assert_eq!(body.status, 400);

    let still_blocked = harness.service.purchase(init.session_id).await.unwrap();
    assert_eq!(
        still_blocked.state,
        PurchaseProcessState::BlockedDueToFraudAdvice
    );
}

#[tokio::test]
async fn both_captchas_clear_a_process_time_block() {
    let harness = Harness::builder()
        .fraud(vec![captcha()], vec![captcha()])
        .build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    harness
        .service
        .validate_captcha(init.session_id, CaptchaStep::Init)
        .await
        .unwrap();

    let blocked = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(
        blocked.outcome,
        PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: true
        }
    );

    let cleared = harness
        .service
        .validate_captcha(init.session_id, CaptchaStep::Process)
        .await
        .unwrap();
    assert_eq!(cleared.state, PurchaseProcessState::Valid);

    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();
    assert_eq!(result.outcome, PurchaseOutcome::Approved);
    // process-time screening runs once per purchase
    assert_eq!(harness.fraud.calls(), 2);
    assert_eq!(harness.metrics.captchas_validated.get(), 2);
}

#[tokio::test]
async fn process_time_block_stops_before_any_charge() {
    let harness = Harness::builder().fraud(vec![allow()], vec![block()]).build();

    let init = harness.service.init_purchase(init_request()).await.unwrap();
    let result = harness
        .service
        .process_purchase(process_request(init.session_id, card()))
        .await
        .unwrap();

    assert_eq!(
        result.outcome,
        PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: false
        }
    );
    assert!(harness
        .gateway(BillerName::Rocketgate)
        .charge_requests()
        .is_empty());
    // only the first attempt's routing, looked up alongside the screen
    let lookups = harness.routing.requests();
    assert!(lookups.len() <= 1);
    assert!(lookups.iter().all(|lookup| lookup.attempt == 1));

    let process = harness.replay(init.session_id).await;
    let advice = process.fraud_advice().unwrap();
    assert!(advice.is_blocked_on_process());
    assert_eq!(
        advice.bin().map(|bin| bin.as_str().to_string()),
        Some("411111".to_string())
    );
}

#[tokio::test]
async fn captcha_answer_for_unknown_session_is_not_found() {
    let harness = Harness::builder().build();
    let err = harness
        .service
        .validate_captcha(purchase_gateway::models::SessionId::new(), CaptchaStep::Init)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::SessionNotFound(_));
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
}
