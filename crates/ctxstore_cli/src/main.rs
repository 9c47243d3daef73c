//! CLI smoke entry point.
//!
//! Runs the two-context propagation scenario against an ephemeral store and
//! prints each step. Exits with status 1 when the store cannot be opened or
//! the scenario does not hold.
//!
//! Usage: `ctxstore_cli [--log-dir <absolute dir>]`

use ctxstore_core::{
    default_log_level, init_logging, ConflictPolicy, EntityKind, Model, Persistence,
    PersistenceConfig, Record, RecordId, SerializationMode, StoreError,
};
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    if let Some(log_dir) = log_dir_arg() {
        if let Err(err) = init_logging(default_log_level(), &log_dir) {
            eprintln!("ctxstore logging disabled: {err}");
        }
    }

    println!("ctxstore_core version={}", ctxstore_core::core_version());
    match run_scenario() {
        Ok(()) => {
            println!("scenario status=ok");
            ExitCode::SUCCESS
        }
        Err(err @ StoreError::Unrecoverable(_)) => {
            eprintln!("scenario status=fatal error={err}");
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("scenario status=error error={err}");
            ExitCode::from(1)
        }
    }
}

fn log_dir_arg() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--log-dir" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

fn run_scenario() -> Result<(), StoreError> {
    let model = Model::new("Smoke", 1).with_kind(EntityKind::new("User"));
    let persistence = Persistence::open(PersistenceConfig::ephemeral(model).from_env())?;

    let context_a = persistence.add_context(SerializationMode::PrivateQueue, ConflictPolicy::Error)?;
    let context_b = persistence.add_context(SerializationMode::PrivateQueue, ConflictPolicy::Error)?;
    let id = RecordId::parse("u1")
        .ok_or_else(|| StoreError::InvalidData("blank record id".to_string()))?;

    context_a.insert(Record::with_id(id.clone(), "User").with("name", "first"))?;
    persistence.save(&context_a)?;
    context_b.drain();
    let seen_in_b = context_b.find(&id)?;
    println!(
        "step=propagate_insert found_in_b={}",
        seen_in_b.as_ref().map(|record| record.id().as_str()).unwrap_or("none")
    );
    if seen_in_b.is_none() {
        return Err(StoreError::NotFound(id));
    }

    context_b.delete(&id)?;
    persistence.save(&context_b)?;
    context_a.drain();
    let seen_in_a = context_a.find(&id)?;
    println!("step=propagate_delete gone_from_a={}", seen_in_a.is_none());
    if seen_in_a.is_some() {
        return Err(StoreError::InvalidData(format!(
            "record {id} still visible after delete"
        )));
    }

    persistence.remove_context(&context_a);
    persistence.remove_context(&context_b);
    Ok(())
}
