use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use uuid::Uuid;

use skimmer_core::events::JobEvent;
use skimmer_core::job::{JobProgress, JobResult, JobStatus, NewJob};
use skimmer_core::job_queue::JobQueue;

use skimmer_core::ratelimit::api_key_fingerprint;

use crate::integration::common::{
    TEST_API_KEY, TestOptions, authed, body_json, body_text, from_peer, get, json_post,
    setup_pg_app, setup_test_app, setup_test_app_with,
};

// ---------------------------------------------------------------------------
// Health & auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_200() {
    let app = setup_test_app();

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["backend"], "memory");
    assert_eq!(json["database"], "disabled");
}

#[tokio::test]
async fn health_checks_postgres() {
    let (app, _container) = setup_pg_app().await;

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["backend"], "postgres");
    assert_eq!(json["database"], "ok");
}

#[tokio::test]
async fn unauthenticated_request_returns_401() {
    let app = setup_test_app();

    let response = app
        .send(Request::get("/v1/jobs").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "unauthorized");
}

#[tokio::test]
async fn wrong_api_key_returns_401() {
    let app = setup_test_app();

    let response = app
        .send(
            Request::get("/v1/jobs")
                .header("authorization", "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn no_configured_keys_allows_anonymous_access() {
    let app = setup_test_app_with(TestOptions::default().without_auth());

    let response = app
        .send(Request::get("/v1/jobs").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_and_get_job() {
    let app = setup_test_app();

    let response = app
        .send(json_post(
            "/v1/jobs",
            json!({"url": "https://example.com/post/1", "type": "article", "priority": 5}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let json = body_json(response).await;
    assert_eq!(json["status"], "queued");
    let job_id = json["job_id"].as_str().unwrap().to_string();

    let response = app.send(get(&format!("/v1/jobs/{job_id}"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["job_id"], job_id.as_str());
    assert_eq!(json["url"], "https://example.com/post/1");
    assert_eq!(json["type"], "article");
    assert_eq!(json["state"], "queued");
    assert_eq!(json["priority"], 5);
    assert_eq!(json["progress"]["status"], "queued");
    assert_eq!(json["progress"]["percentage"], 0);
    assert_eq!(json["attempts"], 0);
    assert_eq!(json["max_attempts"], 3);
    assert!(json.get("result").is_none());
    assert!(json.get("error").is_none());
}

#[tokio::test]
async fn create_job_records_client_identity() {
    let app = setup_test_app();

    let request = from_peer(authed(Request::post("/v1/jobs")), "198.51.100.7")
        .header("content-type", "application/json")
        .header("x-user-id", "alice")
        .body(Body::from(
            serde_json::to_vec(&json!({"url": "https://example.com"})).unwrap(),
        ))
        .unwrap();
    let json = body_json(app.send(request).await).await;
    let id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();

    let job = app.state.queue.get(id).await.unwrap().unwrap();
    assert_eq!(job.identity.ip.as_deref(), Some("198.51.100.7"));
    assert_eq!(job.identity.user_id.as_deref(), Some("alice"));
    assert_eq!(job.identity.api_key_hash, Some(api_key_fingerprint(TEST_API_KEY)));
    let stored = serde_json::to_string(&job.identity).unwrap();
    assert!(!stored.contains(TEST_API_KEY));
}

#[tokio::test]
async fn create_job_without_url_returns_400() {
    let app = setup_test_app();

    let response = app.send(json_post("/v1/jobs", json!({"priority": 1}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"], "validation_error");
}

#[tokio::test]
async fn create_job_with_invalid_url_returns_400() {
    let app = setup_test_app();

    for url in ["ftp://example.com/file", "not a url"] {
        let response = app.send(json_post("/v1/jobs", json!({"url": url}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "url: {url}");
    }
    assert!(app.state.queue.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn get_unknown_job_returns_404() {
    let app = setup_test_app();

    let response = app.send(get(&format!("/v1/jobs/{}", Uuid::new_v4()))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "not_found");
}

#[tokio::test]
async fn get_finished_job_includes_result() {
    let app = setup_test_app();
    let job = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com"))
        .await
        .unwrap();
    app.state.queue.claim("w").await.unwrap();
    let content_id = Uuid::new_v4();
    app.state
        .queue
        .complete(
            job.id,
            "w",
            JobResult {
                content_id,
                title: Some("Hello".into()),
            },
        )
        .await
        .unwrap();

    let json = body_json(app.send(get(&format!("/v1/jobs/{}", job.id))).await).await;
    assert_eq!(json["state"], "completed");
    assert_eq!(json["progress"]["percentage"], 100);
    assert_eq!(json["result"]["content_id"], content_id.to_string());
    assert_eq!(json["result"]["title"], "Hello");
}

#[tokio::test]
async fn cancel_job_lifecycle() {
    let app = setup_test_app();
    let queued = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com/1"))
        .await
        .unwrap();

    let delete = |id: Uuid| {
        authed(Request::delete(format!("/v1/jobs/{id}")))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.send(delete(queued.id)).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        app.state.queue.get(queued.id).await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );

    // Already terminal.
    let response = app.send(delete(queued.id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Active jobs cannot be cancelled.
    let active = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com/2"))
        .await
        .unwrap();
    app.state.queue.claim("w").await.unwrap();
    let response = app.send(delete(active.id)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error"], "conflict");

    let response = app.send(delete(Uuid::new_v4())).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn list_jobs_filters_by_status() {
    let app = setup_test_app();
    for i in 0..3 {
        app.state
            .queue
            .enqueue(NewJob::new(format!("https://example.com/{i}")))
            .await
            .unwrap();
    }
    app.state.queue.claim("w").await.unwrap();

    let json = body_json(app.send(get("/v1/jobs")).await).await;
    assert_eq!(json["total"], 3);

    let json = body_json(app.send(get("/v1/jobs?status=queued")).await).await;
    assert_eq!(json["total"], 2);
    assert!(json["jobs"]
        .as_array()
        .unwrap()
        .iter()
        .all(|j| j["state"] == "queued"));

    let json = body_json(app.send(get("/v1/jobs?status=active&limit=10")).await).await;
    assert_eq!(json["total"], 1);

    let json = body_json(app.send(get("/v1/jobs?limit=1")).await).await;
    assert_eq!(json["total"], 1);

    let response = app.send(get("/v1/jobs?status=exploded")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

fn from_ip(uri: &str, ip: &str) -> Request<Body> {
    from_peer(authed(Request::get(uri)), ip)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn ip_limit_returns_429_with_headers() {
    let app = setup_test_app_with(TestOptions::default().with_ip_limit(2));

    for _ in 0..2 {
        let response = app.send(from_ip("/v1/jobs", "203.0.113.1")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.send(from_ip("/v1/jobs", "203.0.113.1")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let headers = response.headers();
    // 2 per minute refills one token every 30s.
    let retry_after: u64 = headers["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((30..=31).contains(&retry_after), "retry-after {retry_after}");
    assert_eq!(headers["x-ratelimit-limit"], "2");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert!(headers.contains_key("x-ratelimit-reset"));

    let json = body_json(response).await;
    assert_eq!(json["error"], "rate_limited");
    assert_eq!(json["level"], "ip");

    // Other clients are unaffected.
    let response = app.send(from_ip("/v1/jobs", "203.0.113.2")).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Refill after the retry delay.
    app.clock.advance(Duration::from_secs(retry_after + 1));
    let response = app.send(from_ip("/v1/jobs", "203.0.113.1")).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn spoofed_forwarded_for_does_not_escape_ip_limit() {
    let app = setup_test_app_with(TestOptions::default().with_ip_limit(1));

    let spoofed = |forwarded: &str| {
        from_peer(authed(Request::get("/v1/jobs")), "203.0.113.50")
            .header("x-forwarded-for", forwarded)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.send(spoofed("10.0.0.1")).await.status(), StatusCode::OK);
    assert_eq!(
        app.send(spoofed("10.0.0.2")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn trusted_proxy_limits_by_forwarded_address() {
    let app = setup_test_app_with(TestOptions::default().with_ip_limit(1).with_trusted_proxy());

    let via_proxy = |forwarded: &str| {
        from_peer(authed(Request::get("/v1/jobs")), "10.1.1.1")
            .header("x-forwarded-for", forwarded)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(app.send(via_proxy("198.51.100.1")).await.status(), StatusCode::OK);
    assert_eq!(app.send(via_proxy("198.51.100.2")).await.status(), StatusCode::OK);
    assert_eq!(
        app.send(via_proxy("198.51.100.1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn user_limit_spans_addresses() {
    let app = setup_test_app_with(TestOptions::default().with_user_limit(1));

    let as_alice = |ip: &str| {
        from_peer(authed(Request::get("/v1/jobs")), ip)
            .header("x-user-id", "alice")
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.send(as_alice("10.0.0.1")).await.status(), StatusCode::OK);

    let response = app.send(as_alice("10.0.0.2")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await["level"], "user");
}

#[tokio::test]
async fn rate_limit_applies_before_auth() {
    let app = setup_test_app_with(TestOptions::default().with_ip_limit(1));

    let unauthed = |ip: &str| {
        from_peer(Request::get("/v1/jobs"), ip)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(
        app.send(unauthed("192.0.2.1")).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        app.send(unauthed("192.0.2.1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn submission_window_returns_429() {
    let app = setup_test_app_with(TestOptions::default().with_submit_limit(2));

    for i in 0..2 {
        let response = app
            .send(json_post("/v1/jobs", json!({"url": format!("https://example.com/{i}")})))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    let response = app
        .send(json_post("/v1/jobs", json!({"url": "https://example.com/3"})))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("retry-after"));
    let json = body_json(response).await;
    assert_eq!(json["error"], "rate_limited");
    assert!(json.get("level").is_none());

    // Reads are not counted against submissions.
    assert_eq!(app.send(get("/v1/jobs")).await.status(), StatusCode::OK);
    assert_eq!(app.state.queue.list(None, 10).await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

#[tokio::test]
async fn events_for_unknown_job_returns_404() {
    let app = setup_test_app();

    let response = app
        .send(get(&format!("/v1/jobs/{}/events", Uuid::new_v4())))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(app.state.events.topic_count(), 0);
}

#[tokio::test]
async fn events_for_finished_job_end_immediately() {
    let app = setup_test_app();
    let job = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com"))
        .await
        .unwrap();
    app.state.queue.claim("w").await.unwrap();
    app.state
        .queue
        .fail(job.id, "w", "HTTP 404 for https://example.com", None)
        .await
        .unwrap();

    let response = app.send(get(&format!("/v1/jobs/{}/events", job.id))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let text = body_text(response).await;
    assert_eq!(count(&text, "event: progress"), 1);
    assert_eq!(count(&text, "event: error"), 1);
    assert!(text.contains("HTTP 404 for https://example.com"));
    assert_eq!(count(&text, "event: result"), 0);
}

#[tokio::test]
async fn events_stream_progress_then_result() {
    let app = setup_test_app();
    let job = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com"))
        .await
        .unwrap();

    // The handler subscribes before returning the response.
    let response = app.send(get(&format!("/v1/jobs/{}/events", job.id))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let events = &app.state.events;
    events.publish(job.id, JobEvent::progress("fetching", 30));
    events.publish(job.id, JobEvent::progress("extracting", 60));
    events.publish(
        job.id,
        JobEvent::Completed {
            result: JobResult {
                content_id: Uuid::new_v4(),
                title: Some("Done".into()),
            },
        },
    );

    let text = body_text(response).await;
    assert_eq!(count(&text, "event: progress"), 3);
    assert_eq!(count(&text, "event: result"), 1);
    assert_eq!(count(&text, "event: error"), 0);
    assert!(text.find("extracting").unwrap() < text.find("event: result").unwrap());
    assert_eq!(events.topic_count(), 0);
}

#[tokio::test]
async fn events_detect_completion_by_polling() {
    let app = setup_test_app_with(TestOptions::default().with_sse_poll(Duration::from_millis(20)));
    let job = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com"))
        .await
        .unwrap();

    let response = app.send(get(&format!("/v1/jobs/{}/events", job.id))).await;

    // Finished by a worker that never touches this process's event bus.
    app.state.queue.claim("remote").await.unwrap();
    app.state
        .queue
        .update_progress(job.id, "remote", JobProgress::new("extracting", 50))
        .await
        .unwrap();
    app.state
        .queue
        .complete(
            job.id,
            "remote",
            JobResult {
                content_id: Uuid::new_v4(),
                title: None,
            },
        )
        .await
        .unwrap();

    let text = tokio::time::timeout(Duration::from_secs(5), body_text(response))
        .await
        .expect("stream should end once the job is terminal");
    assert_eq!(count(&text, "event: result"), 1);
}

#[tokio::test]
async fn cancel_ends_open_event_streams() {
    let app = setup_test_app();
    let job = app
        .state
        .queue
        .enqueue(NewJob::new("https://example.com"))
        .await
        .unwrap();

    let response = app.send(get(&format!("/v1/jobs/{}/events", job.id))).await;
    let cancel = app
        .send(
            authed(Request::delete(format!("/v1/jobs/{}", job.id)))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(cancel.status(), StatusCode::NO_CONTENT);

    let text = body_text(response).await;
    assert_eq!(count(&text, "event: error"), 1);
    assert!(text.contains("job cancelled"));
}
