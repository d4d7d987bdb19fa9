use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tempfile::NamedTempFile;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parcel_core::dispatch::{Coordinator, SubmitOptions, Targets};
use parcel_core::domain::{DispatchError, RemoteError, ResourceHandle, Value};
use parcel_core::functions::FunctionRegistry;
use parcel_core::{DispatchConfig, LocalCluster};

/// Run a local cluster and dispatch a few demo tasks to it.
#[derive(Debug, Parser)]
#[command(name = "parcel", version)]
struct Opts {
    /// Number of in-process engines.
    #[arg(long, default_value_t = 2)]
    engines: usize,

    /// JSON config file (see `DispatchConfig`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to wait for each demo result, in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    wait_ms: u64,
}

fn demo_functions() -> anyhow::Result<FunctionRegistry> {
    let mut f = FunctionRegistry::new();
    f.register("double", |inv| Ok(Value::Int(inv.int_arg(0)? * 2)))?;
    f.register("add_one", |inv| Ok(Value::Int(inv.int_arg(0)? + 1)))?;
    f.register("sleep_then", |inv| {
        std::thread::sleep(Duration::from_millis(inv.int_arg(0)?.max(0) as u64));
        Ok(inv.arg(1)?.clone())
    })?;
    // closure over an open file: its size in bytes
    f.register("file_size", |inv| {
        let handle = inv
            .captured("handle")?
            .as_resource()
            .ok_or_else(|| RemoteError::type_error("handle must be a resource"))?;
        let meta = handle
            .open()
            .and_then(|file| file.metadata())
            .map_err(|e| RemoteError::new("IOError", e.to_string()))?;
        Ok(Value::Int(meta.len() as i64))
    })?;
    Ok(f)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let config = match &opts.config {
        Some(path) => DispatchConfig::from_path(path)?,
        None => DispatchConfig::default(),
    };
    let wait = Some(Duration::from_millis(opts.wait_ms));

    // (A) engine を起動
    let cluster = LocalCluster::builder()
        .engines(opts.engines)
        .config(config.clone())
        .functions(demo_functions()?)
        .expect_functions(&["double", "add_one", "sleep_then", "file_size"])
        .build()?;

    // (B) coordinator を起動（strict codec のみ）
    let coordinator = Coordinator::builder(cluster.clone(), cluster.clone())
        .config(config)
        .build()?;

    // (C) 単純な呼び出し
    let handle = coordinator
        .apply(Value::function("double"), vec![Value::Int(21)])
        .await?;
    println!("double(21) = {:?}", handle.get(wait).await?);

    // (D) リソースを捕まえた closure: strict では送れない
    closure_demo(&coordinator, wait).await?;

    // (E) 結果の連鎖: a -> b -> c
    let a = coordinator
        .apply(Value::function("sleep_then"), vec![Value::Int(100), Value::Int(1)])
        .await?;
    let b = coordinator
        .apply(Value::function("add_one"), vec![Value::TaskRef(a.task_id())])
        .await?;
    let c = coordinator
        .submit(
            Value::function("double"),
            vec![Value::TaskRef(b.task_id())],
            BTreeMap::new(),
            SubmitOptions::default(),
        )
        .await?;
    println!("double(add_one(1)) = {:?}", c.get(wait).await?);

    // (F) ローカルのタイムアウト: タスクは走り続け、もう一度待てる
    let slow = coordinator
        .apply(Value::function("sleep_then"), vec![Value::Int(200), Value::from("late")])
        .await?;
    match slow.get(Some(Duration::from_millis(10))).await {
        Err(DispatchError::Timeout { task_id }) => println!("{task_id} not ready yet"),
        other => println!("unexpected: {other:?}"),
    }
    println!("slow = {:?}", slow.get(wait).await?);

    // (G) 履歴
    for record in coordinator.find_records(&Default::default()).await {
        println!(
            "{} state={:?} engine={} attempts={}",
            record.task_id,
            record.state,
            record.engine.as_ref().map(|e| e.as_str()).unwrap_or("-"),
            record.attempts
        );
    }
    let counts = coordinator.counts().await;
    println!("counts: {}", serde_json::to_string(&counts)?);

    coordinator.shutdown().await;
    cluster.shutdown().await;
    Ok(())
}

/// A uniquely named file, removed when dropped.
fn demo_file(contents: &[u8]) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("parcel-demo-")
        .suffix(".txt")
        .tempfile()
        .context("cannot create demo file")?;
    file.write_all(contents)
        .and_then(|()| file.flush())
        .with_context(|| format!("cannot write {}", file.path().display()))?;
    Ok(file)
}

async fn closure_demo(coordinator: &Coordinator, wait: Option<Duration>) -> anyhow::Result<()> {
    let file = demo_file(b"hello from parcel\n")?;

    let closure = Value::closure(
        "file_size",
        [("handle", Value::Resource(ResourceHandle::file(file.path())))],
    );

    match coordinator.apply(closure.clone(), vec![]).await {
        Err(e) => println!("strict codecs: {e}"),
        Ok(_) => println!("strict codecs unexpectedly accepted a closure"),
    }

    let engines = coordinator.use_permissive_codec(Targets::All).await?;
    info!(engines = engines.len(), codecs = ?coordinator.codec_names(), "permissive codec enabled");

    let handle = coordinator.apply(closure, vec![]).await?;
    println!("file_size() = {:?}", handle.get(wait).await?);
    Ok(())
}
