use crate::helpers::spawn_app;

#[tokio::test]
async fn live_returns_ok_without_touching_dependencies() {
    let app = spawn_app().await;
    let resp = reqwest::get(format!("{}/health/live", app.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    // liveness exposes no resource metrics
    assert!(body.get("database").is_none());
}

#[tokio::test]
async fn ready_reports_component_status() {
    let app = spawn_app().await;
    let resp = reqwest::get(format!("{}/health/ready", app.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["database"], true);
    assert_eq!(body["providers"], true);
}

#[tokio::test]
async fn detailed_health_exposes_mode_and_circuits() {
    let app = spawn_app().await;
    let resp = reqwest::get(format!("{}/health/detailed", app.addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["mode"], "NORMAL");
    assert_eq!(body["circuits"]["sendgrid-primary"]["state"], "closed");
}
