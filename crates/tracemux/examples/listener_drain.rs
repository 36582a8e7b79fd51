//! End-to-end tour: writer threads emit events through a shared provider
//! while a listener session drains them, finishing with a rundown over the
//! recorded execution checkpoints.
//!
//! Usage:
//!   cargo run --example listener_drain
//!
//! Set RUST_LOG=tracemux=debug to watch the lifecycle, including the
//! checkpoint replay that runs while the session closes.

use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::info;

use tracemux::{
    CallbackRequest, EventLevel, ProviderConfig, SerializationFormat, SessionOptions,
    SessionType, TraceEngine,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let engine = TraceEngine::builder().ignore_environment().build();
    engine.init();
    engine.finish_init();

    engine.add_rundown_execution_checkpoint("boot", Utc::now().timestamp_millis());

    let provider = engine.create_provider(
        "Demo",
        Some(Arc::new(|request: &CallbackRequest| {
            info!(
                session_id = %request.session_id,
                enabled = request.enabled,
                keywords = request.keywords,
                "demo provider toggled"
            );
        })),
    )?;
    let request_event = provider.add_event(1, 0, 0x1, EventLevel::Informational);
    let fault_event = provider.add_event(2, 0, 0x2, EventLevel::Error);

    let options = SessionOptions::new(SessionType::Listener, SerializationFormat::NetTrace4)
        .with_providers(vec![ProviderConfig::new("Demo", 0x3, EventLevel::Verbose)]);
    let session = engine.enable(&options)?;

    let mut writers = Vec::new();
    for worker in 0..2u32 {
        let engine = engine.clone();
        let request_event = Arc::clone(&request_event);
        let fault_event = Arc::clone(&fault_event);
        writers.push(thread::spawn(move || {
            // Every event this thread writes inherits its sticky activity id.
            engine.get_or_create_thread_activity_id();
            for n in 0..5u32 {
                let payload = format!("worker {worker} request {n}");
                engine.write_event(&request_event, payload.as_bytes(), None, None);
            }
            if worker == 0 {
                engine.write_event(&fault_event, b"simulated fault", None, None);
            }
        }));
    }
    for writer in writers {
        writer
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))?;
    }

    engine.add_rundown_execution_checkpoint("writers done", Utc::now().timestamp_millis());

    let mut drained = 0u32;
    let mut faults = 0u32;
    while let Some(instance) = engine.get_next_event(session) {
        drained += 1;
        if instance.event_id == 2 {
            faults += 1;
        }
        println!(
            "event {}/{} thread {} activity {:?} payload {:?}",
            instance.provider_name,
            instance.event_id,
            instance.thread_id,
            instance.activity_id,
            String::from_utf8_lossy(&instance.payload),
        );
    }
    println!("drained {drained} events ({faults} faults) from session {session}");

    engine.disable(session);
    engine.shutdown();
    Ok(())
}
