//! Kex2 pairing simulator.
//!
//! Runs a provisioner and a provisionee in one process over an in-memory
//! relay, optionally with injected relay failures or a tampering adversary.
//!
//! # Usage
//!
//! ```bash
//! # Clean pairing
//! kex2-sim
//!
//! # Provisionee learns the secret late and announces itself with KexStart
//! kex2-sim --late-secret
//!
//! # Relay swaps the first two messages; both sides must fail
//! kex2-sim --fault reorder --timeout-ms 2000
//! ```

use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use kex2_core::{
    ApplicationError, DeviceId, Environment, KexArgs, KexError, MessageRouter,
    ProvisioneeCallbacks, ProvisionerCallbacks, SystemEnv, generate_secret,
    rpc::{HelloArg, HelloRes},
    run_provisionee, run_provisioner,
};
use kex2_relay::{ChaoticRouter, Fault, MemoryRouter, MemoryRouterConfig, TamperingRouter};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Kex2 pairing simulator
#[derive(Parser, Debug)]
#[command(name = "kex2-sim")]
#[command(about = "Pair two in-process devices over a simulated relay")]
#[command(version)]
struct Args {
    /// Pairing timeout in milliseconds
    #[arg(long, default_value = "10000")]
    timeout_ms: u64,

    /// Longest single relay poll in milliseconds
    #[arg(long, default_value = "500")]
    max_poll_ms: u64,

    /// Relay attack (none, corrupt-sender, corrupt-session, corrupt-ciphertext,
    /// reorder, drop)
    #[arg(long, default_value = "none")]
    fault: String,

    /// Probability of a relay operation failing
    #[arg(long, default_value = "0.0")]
    failure_rate: f64,

    /// Seed for relay failure injection
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Deliver the secret to the provisionee late instead of the provisioner
    #[arg(long)]
    late_secret: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

struct SimProvisioner;

#[async_trait]
impl ProvisionerCallbacks for SimProvisioner {
    async fn get_hello_arg(&self) -> Result<HelloArg, ApplicationError> {
        Ok(HelloArg { payload: b"provisioner hello".to_vec() })
    }

    async fn counter_sign(&self, res: HelloRes) -> Result<Vec<u8>, ApplicationError> {
        let mut sig = b"signed:".to_vec();
        sig.extend_from_slice(&res.0);
        Ok(sig)
    }
}

struct SimProvisionee;

#[async_trait]
impl ProvisioneeCallbacks for SimProvisionee {
    async fn handle_hello(&self, arg: HelloArg) -> Result<HelloRes, ApplicationError> {
        tracing::info!(payload = %String::from_utf8_lossy(&arg.payload), "provisionee got hello");
        Ok(HelloRes(b"provisionee key".to_vec()))
    }

    async fn handle_did_counter_sign(&self, sig: Vec<u8>) -> Result<(), ApplicationError> {
        if sig != b"signed:provisionee key" {
            return Err(ApplicationError::new("bad counter-signature"));
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if !(0.0..=1.0).contains(&args.failure_rate) {
        return Err(format!("--failure-rate must be in [0, 1], got {}", args.failure_rate).into());
    }
    let fault = match args.fault.as_str() {
        "none" => None,
        name => Some(name.parse::<Fault>()?),
    };

    let relay = MemoryRouter::with_config(MemoryRouterConfig {
        max_poll: Duration::from_millis(args.max_poll_ms),
    });
    let chaotic = ChaoticRouter::with_seed(relay, args.failure_rate, args.seed);

    tracing::info!(?fault, failure_rate = args.failure_rate, seed = args.seed, "starting pairing");

    let (provisioner, provisionee) = match fault {
        Some(fault) => simulate(TamperingRouter::new(chaotic, fault), &args).await,
        None => simulate(chaotic, &args).await,
    };

    tracing::info!(?provisioner, ?provisionee, "pairing finished");
    provisioner?;
    provisionee?;
    Ok(())
}

async fn simulate<R: MessageRouter>(
    router: R,
    args: &Args,
) -> (Result<(), KexError>, Result<(), KexError>) {
    let env = SystemEnv::new();
    let timeout = Duration::from_millis(args.timeout_ms);
    let secret = generate_secret(&env);

    let provisioner_id = DeviceId::generate(&env);
    let provisionee_id = DeviceId::generate(&env);
    tracing::info!(provisioner = %provisioner_id, provisionee = %provisionee_id, "devices");

    let (secret_tx, secret_rx) = mpsc::channel(1);
    let mut provisioner_args =
        KexArgs::new(router.clone(), env.clone(), provisioner_id).with_timeout(timeout);
    let mut provisionee_args =
        KexArgs::new(router, env.clone(), provisionee_id).with_timeout(timeout);

    if args.late_secret {
        provisioner_args = provisioner_args.with_secret(secret.clone());
        provisionee_args = provisionee_args.with_secret_channel(secret_rx);
    } else {
        provisionee_args = provisionee_args.with_secret(secret.clone());
        provisioner_args = provisioner_args.with_secret_channel(secret_rx);
    }

    let deliver = async move {
        env.sleep(Duration::from_millis(50)).await;
        if secret_tx.send(secret).await.is_err() {
            tracing::warn!("secret receiver gone before delivery");
        }
    };

    let (provisioner, provisionee, ()) = tokio::join!(
        run_provisioner(provisioner_args, SimProvisioner),
        run_provisionee(provisionee_args, SimProvisionee),
        deliver,
    );
    (provisioner, provisionee)
}
