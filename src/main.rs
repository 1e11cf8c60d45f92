use clap::{Parser, Subcommand};
use needledrop::capture;
use needledrop::config::Config;
use needledrop::pipeline;
use needledrop::queue::ScrobbleQueue;
use needledrop::status::StatusHub;
use needledrop::submitter::LastfmSubmitter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "needledrop", about = "Turntable recognition and scrobbling daemon")]
struct Cli {
    /// Config file path (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture/recognize/scrobble pipeline until interrupted
    Run,
    /// Show the last exported pipeline status
    Status,
    /// List available audio input devices
    Devices,
    /// Write a config template to the default location
    Init,
    /// Inspect the durable scrobble queue
    Queue {
        #[command(subcommand)]
        action: QueueCmd,
    },
    /// Verify the configured listening-history credentials
    TestSubmit,
}

#[derive(Subcommand)]
enum QueueCmd {
    /// Show pending entries awaiting submission
    Show,
    /// Show dead-lettered entries (permanently failed)
    DeadLetter,
    /// Acknowledge and remove all dead-lettered entries
    ClearDeadLetter,
}

fn main() {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path);

    match cli.command {
        Commands::Run => {
            let status = StatusHub::new();
            let handle = match pipeline::start(config, status) {
                Ok(h) => h,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };

            let interrupted = Arc::new(AtomicBool::new(false));
            {
                let interrupted = interrupted.clone();
                if let Err(e) = ctrlc::set_handler(move || {
                    interrupted.store(true, Ordering::Relaxed);
                }) {
                    eprintln!("Error: could not install signal handler: {}", e);
                    std::process::exit(1);
                }
            }

            while !interrupted.load(Ordering::Relaxed) && handle.is_running() {
                std::thread::sleep(Duration::from_millis(200));
            }
            let fatal = !handle.is_running();
            handle.stop();
            if fatal {
                eprintln!("Error: pipeline stopped on its own; see log above");
                std::process::exit(1);
            }
        }
        Commands::Status => {
            let path = config.status_path();
            match std::fs::read_to_string(&path) {
                Ok(json) => match serde_json::from_str::<serde_json::Value>(&json) {
                    Ok(snapshot) => print_status(&snapshot),
                    Err(e) => {
                        eprintln!("Error: unreadable status file '{}': {}", path.display(), e);
                        std::process::exit(1);
                    }
                },
                Err(_) => {
                    println!("No status snapshot at {} (is the daemon running?)", path.display());
                }
            }
        }
        Commands::Devices => match capture::list_input_devices() {
            Ok(devices) => {
                if devices.is_empty() {
                    println!("No input devices found.");
                } else {
                    for name in devices {
                        println!("{}", name);
                    }
                }
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        },
        Commands::Init => {
            if config_path.exists() {
                eprintln!("Error: config already exists at {}", config_path.display());
                std::process::exit(1);
            }
            match Config::default().save(&config_path) {
                Ok(()) => println!("Wrote config template to {}", config_path.display()),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Queue { action } => {
            let queue = match ScrobbleQueue::open(&config.state_dir(), StatusHub::new()) {
                Ok(q) => q,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            match action {
                QueueCmd::Show => {
                    let pending = queue.pending();
                    if pending.is_empty() {
                        println!("Queue is empty.");
                        return;
                    }
                    println!("{:<4} {:<40} {:<12} {:<8}", "#", "Track", "Timestamp", "Attempts");
                    println!("{}", "-".repeat(68));
                    for (i, entry) in pending.iter().enumerate() {
                        println!(
                            "{:<4} {:<40} {:<12} {:<8}",
                            i + 1,
                            truncate(&entry.track.display(), 39),
                            entry.recognized_at,
                            entry.attempt_count
                        );
                        if let Some(err) = &entry.last_error {
                            println!("     last error: {}", err);
                        }
                    }
                }
                QueueCmd::DeadLetter => {
                    let dead = queue.dead_letters();
                    if dead.is_empty() {
                        println!("No dead-lettered entries.");
                        return;
                    }
                    for (i, letter) in dead.iter().enumerate() {
                        println!(
                            "{}. {} (at {})",
                            i + 1,
                            letter.entry.track.display(),
                            letter.failed_at
                        );
                        println!("   {}", letter.error);
                    }
                }
                QueueCmd::ClearDeadLetter => match queue.clear_dead_letters() {
                    Ok(count) => println!("Cleared {} dead-lettered entr(y/ies).", count),
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        std::process::exit(1);
                    }
                },
            }
        }
        Commands::TestSubmit => {
            if !config.lastfm.enabled {
                eprintln!("Error: listening-history submission is disabled in config");
                std::process::exit(1);
            }
            let submitter = match LastfmSubmitter::new(&config.lastfm) {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            };
            match submitter.verify_session() {
                Ok(()) => println!("Credentials OK: session accepted."),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }
}

fn print_status(snapshot: &serde_json::Value) {
    let get_u64 = |key: &str| snapshot.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
    let running = snapshot
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    println!("needledrop v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Running: {} | Uptime: {}s | Queue: {} pending, {} dead",
        running,
        get_u64("uptime_secs"),
        get_u64("queue_depth"),
        get_u64("dead_letter_count")
    );
    println!(
        "Windows: {} sampled, {} silent | Recognized: {} | Suppressed: {} | Scrobbled: {}",
        get_u64("windows_sampled"),
        get_u64("windows_silent"),
        get_u64("tracks_recognized"),
        get_u64("duplicates_suppressed"),
        get_u64("scrobbles_submitted")
    );

    match snapshot.get("current_track") {
        Some(serde_json::Value::Object(track)) => {
            let field = |key: &str| track.get(key).and_then(|v| v.as_str()).unwrap_or("?");
            println!(
                "Now playing: {} — {} (via {}, since {})",
                field("artist"),
                field("title"),
                field("provider"),
                field("since")
            );
        }
        _ => println!("Now playing: nothing tracked"),
    }

    if snapshot
        .get("durability_degraded")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        println!("WARNING: queue durability degraded (state writes are failing)");
    }

    if let Some(serde_json::Value::Object(errors)) = snapshot.get("last_errors") {
        for (subsystem, error) in errors {
            if let Some(message) = error.as_str() {
                println!("Last {} error: {}", subsystem, message);
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", cut)
    } else {
        s.to_string()
    }
}
