//! Integration tests for the extraction and task endpoints.

mod common;

use axum::http::StatusCode;
use common::{
    body_json, build_test_app, get, get_as, post_json_as, pyradiomics, Execution, INTRUDER, OWNER,
};
use serde_json::json;

async fn create_album(app: &common::TestApp, album: &str) -> serde_json::Value {
    let response = post_json_as(
        app.router.clone(),
        &format!("/api/v1/extract/album/{album}"),
        pyradiomics(),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn album_extraction_is_created_with_one_task_per_study() {
    let app = build_test_app(Execution::Parked);

    let json = create_album(&app, "lung").await;

    assert_eq!(json["data"]["reused"], false);
    assert_eq!(json["data"]["extraction"]["owner"], OWNER);
    assert_eq!(json["data"]["extraction"]["scope"]["album_id"], "lung");

    let tasks = json["data"]["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 3);
    for task in tasks {
        assert_eq!(task["status"], "QUEUED");
        assert!(task["external_job_token"].is_string());
    }
}

#[tokio::test]
async fn resubmitting_an_active_extraction_reuses_it() {
    let app = build_test_app(Execution::Parked);
    let first = create_album(&app, "lung").await;

    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/album/lung",
        pyradiomics(),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["reused"], true);
    assert_eq!(
        json["data"]["extraction"]["id"],
        first["data"]["extraction"]["id"]
    );
}

#[tokio::test]
async fn study_extraction_is_found_by_study() {
    let app = build_test_app(Execution::Parked);

    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/study/9.9",
        pyradiomics(),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["data"]["tasks"].as_array().unwrap().len(), 1);

    let response = get_as(app.router.clone(), "/api/v1/extractions/study/9.9", OWNER).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["data"]["extraction"]["id"],
        created["data"]["extraction"]["id"]
    );
    assert_eq!(json["data"]["tasks"][0]["study_uid"], "9.9");
}

#[tokio::test]
async fn unknown_album_is_a_scope_error() {
    let app = build_test_app(Execution::Parked);

    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/album/nowhere",
        pyradiomics(),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = body_json(response).await;
    assert_eq!(json["code"], "SCOPE_RESOLUTION_ERROR");
}

#[tokio::test]
async fn empty_album_is_a_scope_error() {
    let app = build_test_app(Execution::Parked);

    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/album/empty",
        pyradiomics(),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn request_without_families_is_rejected() {
    let app = build_test_app(Execution::Parked);

    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/album/lung",
        json!({ "families": {} }),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn feature_families_are_listed() {
    let app = build_test_app(Execution::Parked);

    let response = get_as(app.router.clone(), "/api/v1/feature-families", OWNER).await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let families: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f.as_str().unwrap())
        .collect();
    assert!(families.contains(&"pyradiomics"));
    assert!(families.contains(&"riesz"));
}

#[tokio::test]
async fn extractions_are_listed_per_owner_newest_first() {
    let app = build_test_app(Execution::Parked);
    let lung = create_album(&app, "lung").await;
    let response = post_json_as(
        app.router.clone(),
        "/api/v1/extract/study/9.9",
        pyradiomics(),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let study = body_json(response).await;

    let response = get_as(app.router.clone(), "/api/v1/extractions", OWNER).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let listed = json["data"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0]["extraction"]["id"], study["data"]["extraction"]["id"]);
    assert_eq!(listed[1]["extraction"]["id"], lung["data"]["extraction"]["id"]);
    assert_eq!(listed[1]["status"]["status"], "IN_PROGRESS");
    assert_eq!(listed[1]["status"]["total"], 3);

    let response = get_as(app.router.clone(), "/api/v1/extractions", INTRUDER).await;
    let json = body_json(response).await;
    assert!(json["data"].as_array().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Access control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_identity_is_unauthorized() {
    let app = build_test_app(Execution::Parked);

    let response = get(app.router.clone(), "/api/v1/extractions/1").await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["code"], "UNAUTHORIZED");

    let response = get(app.router.clone(), "/api/v1/extractions").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn other_users_extraction_is_forbidden() {
    let app = build_test_app(Execution::Parked);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();
    let task_id = created["data"]["tasks"][0]["id"].as_i64().unwrap();

    let response = get_as(app.router.clone(), &format!("/api/v1/extractions/{id}"), INTRUDER).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = get_as(app.router.clone(), &format!("/api/v1/tasks/{task_id}"), INTRUDER).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = post_json_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/cancel"),
        json!({}),
        INTRUDER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unknown_extraction_is_not_found() {
    let app = build_test_app(Execution::Parked);

    let response = get_as(app.router.clone(), "/api/v1/extractions/999", OWNER).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
}

// ---------------------------------------------------------------------------
// Status / cancel / latest
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_extraction_is_in_progress() {
    let app = build_test_app(Execution::Parked);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/status"),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "IN_PROGRESS");
    assert_eq!(json["data"]["total"], 3);
    assert_eq!(json["data"]["completed"], 0);
}

#[tokio::test]
async fn cancelling_queued_tasks_fails_the_extraction() {
    let app = build_test_app(Execution::Parked);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();

    let response = post_json_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/cancel"),
        json!({}),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["cancelled"], 3);
    assert_eq!(json["data"]["signalled"], 0);

    let response = get_as(app.router.clone(), &format!("/api/v1/extractions/{id}"), OWNER).await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"]["status"], "FAILED");
    for task in json["data"]["tasks"].as_array().unwrap() {
        assert_eq!(task["state"]["error"]["kind"], "CANCELLED");
    }
}

#[tokio::test]
async fn latest_album_extraction_is_null_until_created() {
    let app = build_test_app(Execution::Parked);

    let response = get_as(app.router.clone(), "/api/v1/extractions/album/lung", OWNER).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["data"].is_null());

    let created = create_album(&app, "lung").await;

    let response = get_as(app.router.clone(), "/api/v1/extractions/album/lung", OWNER).await;
    let json = body_json(response).await;
    assert_eq!(
        json["data"]["extraction"]["id"],
        created["data"]["extraction"]["id"]
    );

    // Scoped per owner.
    let response = get_as(app.router.clone(), "/api/v1/extractions/album/lung", INTRUDER).await;
    assert!(body_json(response).await["data"].is_null());
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn result_is_not_found_before_success() {
    let app = build_test_app(Execution::Parked);
    let created = create_album(&app, "lung").await;
    let task_id = created["data"]["tasks"][0]["id"].as_i64().unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/tasks/{task_id}/result"),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn follow_returns_final_report_and_results_are_readable() {
    let app = build_test_app(Execution::Local);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/follow"),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "COMPLETE");
    assert_eq!(json["data"]["succeeded"], 3);
    assert_eq!(json["data"]["percent"], 100.0);

    let task_id = created["data"]["tasks"][0]["id"].as_i64().unwrap();
    let response = get_as(app.router.clone(), &format!("/api/v1/tasks/{task_id}"), OWNER).await;
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "SUCCEEDED");

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/tasks/{task_id}/result"),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["task_id"], task_id);
    assert_eq!(json["data"]["features"]["pyradiomics_mean"], 2.5);

    app.ctx.shutdown().await;
}

#[tokio::test]
async fn result_with_missing_artifact_is_not_found() {
    let app = build_test_app(Execution::Local);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/follow"),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);

    let task_id = created["data"]["tasks"][0]["id"].as_i64().unwrap();
    let response = get_as(app.router.clone(), &format!("/api/v1/tasks/{task_id}"), OWNER).await;
    let json = body_json(response).await;
    let result_ref = json["data"]["result_ref"].as_str().unwrap().to_string();
    std::fs::remove_file(app.ctx.artifacts.root().join(&result_ref)).unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/tasks/{task_id}/result"),
        OWNER,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");

    app.ctx.shutdown().await;
}

#[tokio::test]
async fn follow_times_out_while_tasks_are_parked() {
    let app = build_test_app(Execution::Parked);
    let created = create_album(&app, "lung").await;
    let id = created["data"]["extraction"]["id"].as_i64().unwrap();

    let response = get_as(
        app.router.clone(),
        &format!("/api/v1/extractions/{id}/follow"),
        OWNER,
    )
    .await;

    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    let json = body_json(response).await;
    assert_eq!(json["code"], "FOLLOW_TIMEOUT");
}
