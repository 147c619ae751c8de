use anyhow::{Context, Result};
use bubble::protocol::Uuid;
use bubble::{Bridge, BridgeConfig, BridgeError, ClientStore, LocationSync, SocketEngine};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "bubble", about = "bubble location sharing client")]
struct Cli {
    /// Path to the engine host's Unix socket.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Engine data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show engine status and the signed-in account.
    Status,
    /// Create an account (prompts for a password).
    Register {
        username: String,
        /// Display name.
        name: String,
        email: String,
    },
    /// Confirm a registration with the emailed token.
    Confirm { token: Uuid },
    /// Sign in (prompts for the password).
    Login {
        /// Username or email.
        user: String,
    },
    /// Sign out.
    Logout,
    /// Request a password reset email.
    Forgot { email: String },
    /// Check that a password reset token is still valid.
    ForgotCheck { token: Uuid },
    /// Set a new password with a reset token (prompts for the password).
    ForgotConfirm { token: Uuid },
    /// Search users by name.
    Search { query: String },
    /// List groups.
    Groups,
    /// Create a group and make it active.
    CreateGroup {
        #[arg(long)]
        name: Option<String>,
    },
    /// Rename a group.
    Rename { group: Uuid, name: String },
    /// Leave a group.
    Leave { group: Uuid },
    /// Add a user to a group.
    AddMember { group: Uuid, user: Uuid },
    /// Remove a user from a group.
    RemoveMember { group: Uuid, user: Uuid },
    /// Share a position with a group.
    SendLocation {
        group: Uuid,
        latitude: f64,
        longitude: f64,
    },
    /// Count the samples a client shared with a group.
    LocationCount {
        group: Uuid,
        client: Uuid,
        /// Start of the window (ms since epoch).
        #[arg(long, default_value_t = 0)]
        from: i64,
        /// End of the window (ms since epoch, default now).
        #[arg(long)]
        to: Option<i64>,
    },
    /// Follow the locations of a group's members until Ctrl-C.
    Watch {
        /// Group to watch (default: the first group).
        #[arg(long)]
        group: Option<Uuid>,
    },
    /// Call an engine method directly.
    Call {
        method: String,
        /// Arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bubble=info".into()),
        )
        .init();

    if let Err(err) = run(Cli::parse()).await {
        match err.downcast_ref::<BridgeError>() {
            Some(bridge_err) => {
                tracing::debug!(err = %bridge_err, "command failed");
                eprintln!("error: {}", bridge_err.user_message());
            }
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = BridgeConfig::load().context("failed to load config")?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    let store = connect(&config).await?;

    match cli.command {
        Command::Status => {
            let status = store.refresh_status().await?;
            print_json(&status)
        }
        Command::Register {
            username,
            name,
            email,
        } => {
            let password = prompt_new_password()?;
            store.register(&username, &password, &name, &email).await?;
            println!("Registered. Check {email} for a confirmation link.");
            Ok(())
        }
        Command::Confirm { token } => {
            let user_uuid = store.confirm(token).await?;
            println!("Confirmed. Signed in as {user_uuid}.");
            Ok(())
        }
        Command::Login { user } => {
            let password =
                rpassword::prompt_password("Password: ").context("failed to read password")?;
            let user_uuid = store.login(&user, &password).await?;
            println!("Signed in as {user_uuid}.");
            Ok(())
        }
        Command::Logout => {
            store.logout().await?;
            println!("Signed out.");
            Ok(())
        }
        Command::Forgot { email } => {
            store.forgot(&email).await?;
            println!("Reset email sent to {email}.");
            Ok(())
        }
        Command::ForgotCheck { token } => {
            if store.forgot_check(token).await? {
                println!("Token is valid.");
            } else {
                println!("Token is expired or unknown.");
            }
            Ok(())
        }
        Command::ForgotConfirm { token } => {
            let password = prompt_new_password()?;
            store.forgot_confirm(&password, token).await?;
            println!("Password updated.");
            Ok(())
        }
        Command::Search { query } => {
            let users = store.search(&query).await?;
            print_json(&users)
        }
        Command::Groups => {
            let groups = store.refresh_groups().await?;
            print_json(&groups)
        }
        Command::CreateGroup { name } => {
            let uuid = store.create_group(name.as_deref()).await?;
            println!("{uuid}");
            Ok(())
        }
        Command::Rename { group, name } => {
            store.update_group(group, Some(&name)).await?;
            println!("Renamed.");
            Ok(())
        }
        Command::Leave { group } => {
            store.leave_group(group).await?;
            println!("Left group.");
            Ok(())
        }
        Command::AddMember { group, user } => {
            store.add_member(group, user).await?;
            store.send_group_status(group).await?;
            println!("Added.");
            Ok(())
        }
        Command::RemoveMember { group, user } => {
            store.remove_member(group, user).await?;
            println!("Removed.");
            Ok(())
        }
        Command::SendLocation {
            group,
            latitude,
            longitude,
        } => {
            store.send_location(group, latitude, longitude).await?;
            println!("Sent.");
            Ok(())
        }
        Command::LocationCount {
            group,
            client,
            from,
            to,
        } => {
            let to = to.unwrap_or_else(bubble::time::now_ms);
            let count = store.location_count(group, client, from, to).await?;
            println!("{count}");
            Ok(())
        }
        Command::Watch { group } => cmd_watch(store, group, &config).await,
        Command::Call { method, args } => {
            let args: serde_json::Value =
                serde_json::from_str(&args).context("invalid JSON args object")?;
            match store.bridge().invoke_raw(&method, &args).await? {
                Ok(value) => print_json(&value),
                Err(value) => {
                    anyhow::bail!("{method} failed: {value}");
                }
            }
        }
    }
}

async fn connect(config: &BridgeConfig) -> Result<Arc<ClientStore<SocketEngine>>> {
    let bridge = Arc::new(Bridge::new(SocketEngine::new(&config.socket_path)));
    bridge
        .init(config.data_dir.to_string_lossy())
        .await
        .with_context(|| {
            format!(
                "failed to start engine session via {}",
                config.socket_path.display()
            )
        })?;
    Ok(Arc::new(ClientStore::new(bridge)))
}

async fn cmd_watch(
    store: Arc<ClientStore<SocketEngine>>,
    group: Option<Uuid>,
    config: &BridgeConfig,
) -> Result<()> {
    store.refresh_groups().await?;
    if group.is_some() {
        store.set_active_group(group)?;
    }
    let Some(active) = store.snapshot().active().cloned() else {
        anyhow::bail!("no groups to watch");
    };
    eprintln!(
        "Watching {} (Ctrl-C to stop)",
        active.name.as_deref().unwrap_or("unnamed group")
    );

    let sync = Arc::new(LocationSync::with_interval(
        Arc::clone(&store),
        config.poll_interval(),
    ));
    let follower = sync.follow_active();
    let mut updates = sync.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().snapshot.clone();
                if let Some(snapshot) = snapshot {
                    for loc in &snapshot.locations {
                        println!(
                            "{}\t{:.6}\t{:.6}\t{}",
                            loc.user.username, loc.latitude, loc.longitude, loc.timestamp
                        );
                    }
                }
            }
        }
    }

    follower.abort();
    sync.stop();
    Ok(())
}

fn prompt_new_password() -> Result<String> {
    loop {
        let pass1 = rpassword::prompt_password("Password: ").context("failed to read password")?;
        let pass2 =
            rpassword::prompt_password("Confirm password: ").context("failed to read password")?;
        if pass1 == pass2 {
            return Ok(pass1);
        }
        eprintln!("Passwords do not match. Try again.");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
