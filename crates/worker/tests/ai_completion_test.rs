mod common;

use serde_json::json;

use common::Harness;
use taskhub_domain::{ErrorKind, QuotaPeriod, QuotaResource, TaskStatus};
use taskhub_errors::HubError;
use taskhub_infrastructure::testing::{MockProviderClient, TaskDescriptorBuilder};

fn chat_input(model: &str, max_tokens: u64) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": "回答要简短"},
            {"role": "user", "content": "总结本周发布计划"}
        ],
        "max_tokens": max_tokens,
        "temperature": 0.2
    })
}

#[tokio::test(start_paused = true)]
async fn test_reasoning_completion_records_usage_and_cost() {
    let provider = MockProviderClient::new().respond(40, 85, json!({"role": "assistant", "content": "三篇文章"}));
    let h = Harness::new(provider).await;
    h.hub
        .quota()
        .set_limit("acme", QuotaResource::Tokens, 10_000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();

    let task = h
        .hub
        .submit(TaskDescriptorBuilder::new("chat_completion").input(chat_input("o3", 200)).build())
        .await
        .unwrap();
    h.advance(3);

    let finished = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(finished.id, task.id);
    assert_eq!(finished.status, TaskStatus::Completed);

    let result = finished.result.clone().unwrap();
    assert_eq!(result["family"], "reasoning");
    assert_eq!(result["usage"]["tokens_in"], 40);
    assert_eq!(result["usage"]["tokens_out"], 85);
    assert_eq!(result["usage"]["cost"], 0.01);
    assert_eq!(finished.warnings.len(), 1);
    assert!(finished.warnings[0].contains("temperature"));

    // 推理模型方言
    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    let body = &requests[0].body;
    assert_eq!(body["messages"][0]["role"], "developer");
    assert_eq!(body["messages"][1]["content"][0]["type"], "text");
    assert_eq!(body["max_completion_tokens"], 200);
    assert!(body.get("max_tokens").is_none());
    assert!(body.get("temperature").is_none());
    assert_eq!(h.provider.api_keys(), vec!["sk-acme-test".to_string()]);

    let tokens = h.hub.quota().usage("acme", QuotaResource::Tokens).await.unwrap().unwrap();
    assert_eq!(tokens.used, 125.0);

    let metric = h.metrics.get(task.id).await.unwrap().unwrap();
    assert_eq!(metric.tokens_in, 40);
    assert_eq!(metric.tokens_out, 85);
    assert_eq!(metric.cost, 0.01);
    assert_eq!(metric.api_calls, 1);
    assert_eq!(metric.error_count, 0);
    assert_eq!(metric.warning_count, 1);
    assert_eq!(metric.retry_count, 0);
    assert_eq!(metric.queue_wait_ms, 3000);
    assert_eq!(metric.worker_id, "worker-1");
}

#[tokio::test(start_paused = true)]
async fn test_legacy_model_uses_flat_messages() {
    let provider = MockProviderClient::new().respond(10, 5, json!("ok"));
    let h = Harness::new(provider).await;
    h.hub
        .submit(
            TaskDescriptorBuilder::new("chat_completion")
                .input(chat_input("gpt-3.5-turbo", 64))
                .build(),
        )
        .await
        .unwrap();

    let finished = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert!(finished.warnings.is_empty());

    let body = &h.provider.requests()[0].body;
    assert_eq!(body["messages"][0]["role"], "system");
    assert_eq!(body["messages"][1]["content"], "总结本周发布计划");
    assert_eq!(body["max_tokens"], 64);
    assert_eq!(body["temperature"], 0.2);
}

#[tokio::test(start_paused = true)]
async fn test_quota_preflight_fails_without_calling_provider() {
    let h = Harness::new(MockProviderClient::new().respond(40, 85, json!("unused"))).await;
    let quota = h.hub.quota();
    quota
        .set_limit("acme", QuotaResource::Tokens, 1000.0, QuotaPeriod::Monthly, true)
        .await
        .unwrap();
    quota.consume("acme", QuotaResource::Tokens, 950.0).await.unwrap();

    h.hub
        .submit(TaskDescriptorBuilder::new("chat_completion").input(chat_input("o3", 100)).build())
        .await
        .unwrap();

    let finished = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.error.as_ref().unwrap().kind, ErrorKind::QuotaExceeded);
    assert!(h.provider.requests().is_empty());

    let tokens = quota.usage("acme", QuotaResource::Tokens).await.unwrap().unwrap();
    assert_eq!(tokens.used, 950.0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_provider_schedules_retry() {
    let provider = MockProviderClient::new()
        .fail(HubError::Retryable("供应商返回状态码 429".into()))
        .respond(12, 30, json!("第二次成功"));
    let h = Harness::new(provider).await;
    let task = h
        .hub
        .submit(
            TaskDescriptorBuilder::new("chat_completion")
                .input(chat_input("gpt-4.1-mini", 50))
                .build(),
        )
        .await
        .unwrap();

    let retried = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    assert_eq!(retried.attempts, 1);
    let error = retried.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Retryable);
    assert_eq!(error.code.as_deref(), Some("rate_limited"));
    // 非终态不写指标
    assert!(h.metrics.get(task.id).await.unwrap().is_none());

    // 退避 5 秒内不会被再次领取
    assert!(h.worker.process_next().await.unwrap().is_none());
    h.advance(5);

    let finished = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Completed);
    assert_eq!(finished.attempts, 2);
    let metric = h.metrics.get(task.id).await.unwrap().unwrap();
    assert_eq!(metric.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_reasoning_effort_fails_fast() {
    let h = Harness::new(MockProviderClient::new()).await;
    let mut input = chat_input("o3-mini", 100);
    input["reasoning_effort"] = json!("extreme");
    h.hub
        .submit(TaskDescriptorBuilder::new("chat_completion").input(input).build())
        .await
        .unwrap();

    let finished = h.worker.process_next().await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Failed);
    assert_eq!(finished.error.unwrap().kind, ErrorKind::InvalidInput);
    assert!(h.provider.requests().is_empty());
}
