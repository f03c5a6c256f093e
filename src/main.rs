use grapevine::commands;
use grapevine::{Error, Overlord, GLOBALS};
use serde_json::json;
use std::ops::DerefMut;
use std::{env, mem};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

fn main() -> Result<(), Error> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }

    let env_filter = EnvFilter::from_default_env();
    let max_level = match env_filter.max_level_hint() {
        Some(level) => level,
        None => LevelFilter::ERROR,
    };
    let show_debug = cfg!(debug_assertions) || max_level <= LevelFilter::DEBUG;
    tracing_subscriber::fmt::fmt()
        .with_target(false)
        .with_file(show_debug)
        .with_line_number(show_debug)
        .with_env_filter(env_filter)
        .init();

    // Setup the database (possibly create, possibly upgrade)
    grapevine::setup_database()?;

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(tokio_main());

    Ok(())
}

async fn tokio_main() {
    // Steal `tmp_overlord_receiver` from the GLOBALS, and give it to a new Overlord
    let overlord_receiver = {
        let mut mutex_option = GLOBALS.tmp_overlord_receiver.lock().await;
        mem::replace(mutex_option.deref_mut(), None)
    }
    .unwrap();

    // Forward pushed status snapshots to the host application
    let mut status_updates = GLOBALS.status_updates.subscribe();
    tokio::spawn(async move {
        loop {
            match status_updates.recv().await {
                Ok(snapshot) => {
                    println!("{}", json!({"push": "status", "status": snapshot}));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });

    // The command channel: one JSON command per line on stdin, one JSON
    // reply per line on stdout
    tokio::spawn(async move {
        let stdin = tokio::io::BufReader::new(tokio::io::stdin());
        let mut lines = stdin.lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply = commands::handle_command(line).await;
            println!("{}", reply);
        }
    });

    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = grapevine::initiate_shutdown();
        }
    });

    // Run the overlord
    let mut overlord = Overlord::new(overlord_receiver);
    overlord.run().await;
}
