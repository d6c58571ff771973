// Integration tests for `CloudClient` and `CloudTransport` using wiremock.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sunpoll_api::{CloudClient, CloudTransport, DeviceRole, Error, HttpConfig, RegisterRange, Transport};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, Arc<CloudClient>) {
    let server = MockServer::start().await;
    let client = CloudClient::new(
        Url::parse(&server.uri()).unwrap(),
        "installer@example.com",
        SecretString::from("hunter2".to_owned()),
        &HttpConfig::default(),
    )
    .unwrap();
    (server, Arc::new(client))
}

async fn mount_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/WManage/api/login"))
        .and(body_string_contains("account=installer%40example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "JSESSIONID=abc123; Path=/")
                .set_body_json(json!({ "success": true })),
        )
        .mount(server)
        .await;
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_login_then_read_runtime() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/inverter/getInverterRuntime"))
        .and(body_string_contains("serialNum=4512345678"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "status": 16,
            "vpv1": 3804,
            "ppv1": 2100,
            "ppv2": 1900,
            "vBat": 532,
            "soc": 87,
            "pCharge": 1500,
            "pDisCharge": 0,
            "fac": 5999,
            "pToGrid": 0,
            "pToUser": 240,
            "tinner": 41
        })))
        .mount(&server)
        .await;

    let mut transport = CloudTransport::new(Arc::clone(&client), "4512345678");
    transport.connect().await.unwrap();
    assert!(client.is_logged_in());

    let raw = transport.read_runtime().await.unwrap();
    assert_eq!(raw.status, 16);
    assert_eq!(raw.ppv, [Some(2100), Some(1900), None]);
    assert_eq!(raw.soc, Some(87));
    assert_eq!(raw.p_charge, Some(1500));
    assert_eq!(raw.p_to_user, Some(240));
    assert_eq!(raw.t_inner, Some(41));
}

#[tokio::test]
async fn test_remote_read_chunks_large_ranges() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/web/maintain/remoteRead/read"))
        .and(body_string_contains("startRegister=0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "valueFrame": "0100".repeat(127)
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/WManage/web/maintain/remoteRead/read"))
        .and(body_string_contains("startRegister=127"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "valueFrame": "0200".repeat(33)
        })))
        .mount(&server)
        .await;

    client.ensure_session().await.unwrap();
    let params = client
        .remote_read("4512345678", RegisterRange::new(0, 160))
        .await
        .unwrap();
    assert_eq!(params.len(), 160);
    assert_eq!(params.get(&126), Some(&1));
    assert_eq!(params.get(&127), Some(&2));
    assert_eq!(params.get(&159), Some(&2));
}

#[tokio::test]
async fn test_midbox_runtime_for_controller() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/midbox/getMidboxRuntime"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "midboxData": {
                "gridL1ActivePower": 100,
                "gridL2ActivePower": 50,
                "smartPort1Status": 2,
                "acCouple1L1ActivePower": 700
            }
        })))
        .mount(&server)
        .await;

    let mut transport =
        CloudTransport::new(Arc::clone(&client), "GC00000001").with_role(DeviceRole::GridController);
    transport.connect().await.unwrap();
    assert!(transport.supports_controller());

    let controller = transport.as_controller().unwrap();
    let runtime = controller.read_controller_runtime().await.unwrap();
    assert_eq!(runtime.grid_power, [Some(100), Some(50)]);
    assert_eq!(runtime.smart_port_status[0], Some(2));
    assert_eq!(runtime.ac_couple_power[0], [Some(700), None]);
}

// ── Error-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_login_rejected() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "msg": "accountOrPasswordError"
        })))
        .mount(&server)
        .await;

    let err = client.ensure_session().await.unwrap_err();
    match err {
        Error::Authentication { message } => assert_eq!(message, "accountOrPasswordError"),
        other => panic!("expected Authentication, got {other:?}"),
    }
    assert!(!client.is_logged_in());
}

#[tokio::test]
async fn test_unauthorized_marks_session_expired() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/inverter/getInverterEnergyInfo"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let mut transport = CloudTransport::new(Arc::clone(&client), "4512345678");
    transport.connect().await.unwrap();

    let err = transport.read_energy().await.unwrap_err();
    assert!(err.is_auth_expired());
    assert!(!client.is_logged_in());
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn test_need_login_message_is_session_expiry() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/battery/getBatteryInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "msg": "needLogin"
        })))
        .mount(&server)
        .await;

    client.ensure_session().await.unwrap();
    let err = client.battery_info("4512345678").await.unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
}

#[tokio::test]
async fn test_api_error_carries_message() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/web/maintain/remoteSet/write"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "msg": "DEVICE_OFFLINE"
        })))
        .mount(&server)
        .await;

    client.ensure_session().await.unwrap();
    let err = client.remote_write("4512345678", 64, 80).await.unwrap_err();
    match err {
        Error::CloudApi { message } => assert_eq!(message, "DEVICE_OFFLINE"),
        other => panic!("expected CloudApi, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_body_keeps_raw_text() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    Mock::given(method("POST"))
        .and(path("/WManage/api/inverter/getInverterInfo"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    client.ensure_session().await.unwrap();
    let err = client.inverter_info("4512345678").await.unwrap_err();
    match err {
        Error::Deserialization { body, .. } => assert!(body.contains("maintenance")),
        other => panic!("expected Deserialization, got {other:?}"),
    }
}

#[tokio::test]
async fn test_controller_reads_rejected_on_inverter_binding() {
    let (server, client) = setup().await;
    mount_login(&server).await;

    let mut transport = CloudTransport::new(Arc::clone(&client), "4512345678");
    transport.connect().await.unwrap();
    assert!(!transport.supports_controller());
    assert!(transport.as_controller().is_none());
}
