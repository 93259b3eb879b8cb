use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use tsumugi_core::{
    EngineError, PropertyKey, ScopedTaskContext, Task, TaskAction, TaskContext, TaskExecutor,
    TaskRegistry,
};

#[derive(Debug, Clone, Serialize)]
struct Report {
    source: String,
    records: usize,
}

/// 上流タスク：取得結果を property として publish する
struct FetchRecords {
    output: PropertyKey<serde_json::Value>,
}

#[async_trait]
impl TaskAction for FetchRecords {
    async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
        let payload = serde_json::json!({
            "source": "demo",
            "records": ["alpha", "beta", "gamma"],
        });
        ctx.set(&self.output, payload);
        Ok(())
    }
}

/// 下流タスク：依存タスクの出力を読んで要約を publish する
struct Summarize {
    input: PropertyKey<serde_json::Value>,
    output: PropertyKey<Report>,
}

#[async_trait]
impl TaskAction for Summarize {
    async fn run(&self, ctx: &mut ScopedTaskContext) -> Result<(), EngineError> {
        let fetched = ctx
            .get(&self.input)
            .ok_or_else(|| EngineError::Other("fetch output missing".into()))?;

        let source = fetched["source"].as_str().unwrap_or("unknown").to_string();
        let records = fetched["records"].as_array().map(Vec::len).unwrap_or(0);

        ctx.set(&self.output, Report { source, records });
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // (A) property keys を用意（書き手と読み手で同じ key 値を共有する）
    let fetched: PropertyKey<serde_json::Value> = PropertyKey::named("fetched");
    let report: PropertyKey<Report> = PropertyKey::named("report");

    // (B) タスク定義と registry への登録
    let fetch = Task::named("fetch").with_action(FetchRecords { output: fetched });
    let summarize = Task::named("summarize")
        .depends_on(fetch.reference())
        .with_action(Summarize {
            input: fetched,
            output: report,
        });

    let registry = Arc::new(TaskRegistry::new());
    registry.register([fetch.clone(), summarize.clone()]);

    // (C) summarize を実行 → fetch が先に走り、その出力が流れてくる
    let executor = TaskExecutor::new(registry);
    let ctx = executor.execute_with_dependencies(&summarize).await?;

    let result = ctx
        .get(&report)
        .ok_or_else(|| EngineError::Other("report missing".into()))?;
    println!("report: source={} records={}", result.source, result.records);

    // (D) 完了済みタスクの出力を async に取り出す（log replay なので後からでも届く）
    let rx = fetch.output_async(fetched, &executor);
    match rx.await {
        Ok(value) => println!("fetch output (async): {value}"),
        Err(_) => println!("fetch completed without output"),
    }

    // (E) completion history のダンプ
    let history = serde_json::to_string_pretty(&executor.history())
        .map_err(|e| EngineError::Other(e.to_string()))?;
    println!("history: {history}");

    Ok(())
}
