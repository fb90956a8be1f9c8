use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use orbit_server::{
    bootstrap, init_logging, NdjsonPublisher, Orbit, OrbitConfig, OrbitTableReceiver, SimTransport,
};

/// Sample rate of the simulated beamline, in Hz.
const SIM_RATE_HZ: f64 = 10.0;

/// How long startup waits for the BPM set to connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = "orbit-server",
    about = "Aggregates BPM channels into a published orbit table",
    disable_help_subcommand = true
)]
struct Cli {
    /// Serve a synthetic 101-BPM orbit instead of reading a machine model.
    #[arg(long)]
    fake: bool,
    /// `MODEL_PV EDEF OUTPUT_PV`, or just `OUTPUT_PV` with `--fake`.
    #[arg(value_name = "ARG")]
    args: Vec<String>,
}

enum Mode {
    Model {
        model_pv: String,
        edef_suffix: String,
        output_pv: String,
    },
    Fake {
        output_pv: String,
    },
}

fn parse_mode() -> Result<Mode, ExitCode> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return Err(ExitCode::FAILURE);
        }
    };
    match (cli.fake, cli.args.as_slice()) {
        (true, [output_pv]) => Ok(Mode::Fake {
            output_pv: output_pv.clone(),
        }),
        (false, [model_pv, edef_suffix, output_pv]) => Ok(Mode::Model {
            model_pv: model_pv.clone(),
            edef_suffix: edef_suffix.clone(),
            output_pv: output_pv.clone(),
        }),
        _ => {
            eprintln!("Usage: orbit-server [MODEL_PV] [EDEF] [OUTPUT_PV]");
            eprintln!("       orbit-server --fake [OUTPUT_PV]");
            Err(ExitCode::FAILURE)
        }
    }
}

async fn run(mode: Mode) -> anyhow::Result<()> {
    let transport = Arc::new(SimTransport::new(SIM_RATE_HZ));
    let (spec, output_pv) = match mode {
        Mode::Fake { output_pv } => (bootstrap::fake_spec(), output_pv),
        Mode::Model {
            model_pv,
            edef_suffix,
            output_pv,
        } => (
            bootstrap::bpm_spec_from_model(transport.as_ref(), &model_pv, &edef_suffix).await?,
            output_pv,
        ),
    };

    info!(bpms = spec.num_bpms(), "connecting to BPMs");
    let orbit = Orbit::new(transport.clone(), spec, OrbitConfig::default()).await?;
    let receiver = Arc::new(OrbitTableReceiver::new(
        output_pv.clone(),
        Arc::new(NdjsonPublisher::stdout()),
    ));
    orbit.add_receiver(receiver);

    if !orbit.wait_for_connection(CONNECT_TIMEOUT).await {
        orbit.close().await;
        anyhow::bail!("timed out waiting for BPM connections");
    }
    info!(pv = %output_pv, "serving orbit table");

    tokio::signal::ctrl_c()
        .await
        .context("failed to wait for shutdown signal")?;
    info!("shutdown signal received");
    orbit.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = init_logging(None) {
        eprintln!("failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }
    let mode = match parse_mode() {
        Ok(mode) => mode,
        Err(code) => return code,
    };
    match run(mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "orbit server failed");
            ExitCode::FAILURE
        }
    }
}
