use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use ethers::{
    providers::{Provider, Ws},
    types::Address,
};
use rollup_challenger_driver::{
    backend::{Backend, LiveBackend, SimBackend},
    watcher::{EventWatcher, ExecutionDecoder},
    ActiveDisputes, BlockIdentity, ChallengeSession, DisputeDriver, Driver, DriverConfig,
    HeadTrackerDriver, Notification, TrackerError, WatchError,
};
use rollup_challenger_protocol::bisection::{
    AlphabetSolver, AlphabetTrace, AlphabetVerifier, BisectionChallenge, Outcome, Party,
    SegmentClaim, StepRange, TimeBounds,
};
use serde_json::json;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::Level;

/// The address the simulated challenge contract is deployed at.
const SIM_CONTRACT: Address = Address::repeat_byte(0xc0);

/// Arguments for the `rollup-challenger` binary.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Verbosity level (0-4)
    #[arg(long, short, help = "Verbosity level (0-4)", action = ArgAction::Count, env = "VERBOSITY")]
    v: u8,

    /// A JSON file holding the driver configuration.
    #[arg(
        long,
        short,
        help = "A JSON file holding the driver configuration. Missing fields take their default value.",
        env = "ROLLUP_CHALLENGER_CONFIG"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow the chain head of a node and print the events of a challenge contract.
    Watch {
        /// The Websocket RPC endpoint used to index and send transactions.
        #[arg(
            long,
            short,
            help = "The Websocket RPC endpoint used to index and send transactions.",
            env = "ROLLUP_CHALLENGER_WS"
        )]
        ws_endpoint: String,

        /// The address of the execution challenge contract to watch.
        #[arg(
            long,
            short = 'a',
            help = "The address of the execution challenge contract to watch.",
            env = "ROLLUP_CHALLENGER_CONTRACT"
        )]
        challenge_address: Option<Address>,

        /// The first block to report. Defaults to the latest block.
        #[arg(long, help = "The first block to report. Defaults to the latest block.")]
        from_block: Option<u64>,
    },
    /// Play an execution challenge over the alphabet machine on a simulated ledger.
    Simulate {
        /// The number of steps of the disputed computation.
        #[arg(long, default_value_t = 16)]
        total_steps: u64,

        /// The number of segments of every bisection. Overrides the configuration.
        #[arg(long)]
        fan_out: Option<u64>,

        /// The number of blocks a participant has to respond. Overrides the configuration.
        #[arg(long)]
        timeout_window: Option<u64>,

        /// The step at which the faulty trace diverges. Defaults to the middle of the trace.
        #[arg(long)]
        fault_step: Option<u64>,

        /// The side that runs the faulty trace.
        #[arg(long, value_enum, default_value_t = Side::Asserter)]
        faulty: Side,

        /// Do not run the asserter, so that it times out.
        #[arg(long)]
        silent_asserter: bool,

        /// The time between two simulated blocks, in milliseconds.
        #[arg(long, default_value_t = 100)]
        block_time_ms: u64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Asserter,
    Challenger,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse the command arguments
    let Args { v, config, command } = Args::parse();

    // Initialize the tracing subscriber
    init_tracing_subscriber(v)?;

    let config = match config {
        Some(path) => DriverConfig::from_json_file(path)?,
        None => DriverConfig::default(),
    };
    tracing::info!(target: "rollup-challenger-cli", "Driver config loaded successfully.");

    match command {
        Command::Watch {
            ws_endpoint,
            challenge_address,
            from_block,
        } => watch(config, ws_endpoint, challenge_address, from_block).await,
        Command::Simulate {
            total_steps,
            fan_out,
            timeout_window,
            fault_step,
            faulty,
            silent_asserter,
            block_time_ms,
        } => {
            let mut config = config;
            config.challenge.fan_out = fan_out.unwrap_or(config.challenge.fan_out);
            config.challenge.timeout_window =
                timeout_window.unwrap_or(config.challenge.timeout_window);
            config.challenge.validate()?;

            let plan = SimulationPlan {
                total_steps,
                fault_step: fault_step.unwrap_or(total_steps / 2),
                faulty,
                silent_asserter,
                block_time: Duration::from_millis(block_time_ms.max(1)),
            };
            simulate(config, plan).await
        }
    }
}

/// Runs the `watch` command until interrupted.
async fn watch(
    config: DriverConfig,
    ws_endpoint: String,
    challenge_address: Option<Address>,
    from_block: Option<u64>,
) -> Result<()> {
    let config = Arc::new(config);

    tracing::debug!(target: "rollup-challenger-cli", "Connecting to websocket endpoint...");
    let provider = Provider::<Ws>::connect(ws_endpoint.as_str()).await?;
    let backend: Arc<dyn Backend> = Arc::new(LiveBackend::new(Arc::new(provider), config.tx_policy));
    tracing::info!(target: "rollup-challenger-cli", "Websocket connected @ {}", ws_endpoint);

    let (shutdown, _) = broadcast::channel(1);
    let (heads_tx, mut heads) = mpsc::channel::<BlockIdentity>(config.tracker.buffer.max(1));
    let head_driver = HeadTrackerDriver::new(
        Arc::clone(&backend),
        Arc::clone(&config),
        heads_tx,
        shutdown.clone(),
    );
    let head_driver = tokio::spawn(head_driver.start_loop());
    tokio::spawn(async move {
        while let Some(head) = heads.recv().await {
            tracing::info!(target: "rollup-challenger-cli", "New head {}", head);
        }
    });

    let events = async {
        match challenge_address {
            Some(address) => {
                let from_block = match from_block {
                    Some(height) => height,
                    None => backend.current_block_identity().await?.height,
                };
                print_events(&config, Arc::clone(&backend), address, from_block, &shutdown).await
            }
            None => std::future::pending().await,
        }
    };

    let result = tokio::select! {
        result = head_driver => result.map_err(|e| anyhow!(e)).and_then(|r| r),
        result = events => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(target: "rollup-challenger-cli", "Interrupted, shutting down.");
            Ok(())
        }
    };
    let _ = shutdown.send(());
    result
}

/// Prints every event of the challenge contract at `address` as a JSON line. The stream is
/// reopened below the reorged block after a reorg, which may print some events twice.
async fn print_events(
    config: &DriverConfig,
    backend: Arc<dyn Backend>,
    address: Address,
    from_block: u64,
    shutdown: &broadcast::Sender<()>,
) -> Result<()> {
    let watcher = EventWatcher::new(address, ExecutionDecoder::default(), backend, config);
    let mut position = (from_block, 0);

    loop {
        let mut stream = watcher
            .open_event_stream(position.0, position.1, shutdown.subscribe())
            .await?;

        loop {
            match stream.recv().await {
                Some(Ok(Notification::Event(observed))) => {
                    println!("{}", serde_json::to_string(&observed)?);
                    position = (observed.block.height, observed.log_index + 1);
                }
                Some(Ok(Notification::Block(block))) => {
                    tracing::debug!(target: "rollup-challenger-cli", "Block {} fully reported", block);
                    position = (block.height + 1, 0);
                }
                Some(Err(WatchError::Tracker(TrackerError::Reorg { height, .. }))) => {
                    position = (height.saturating_sub(1 + config.reorg_rollback_depth), 0);
                    tracing::warn!(target: "rollup-challenger-cli", "Reorg at block {}, reopening from block {}", height, position.0);
                    break;
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(()),
            }
        }
    }
}

/// The parameters of a simulated dispute.
struct SimulationPlan {
    total_steps: u64,
    fault_step: u64,
    faulty: Side,
    silent_asserter: bool,
    block_time: Duration,
}

/// Runs the `simulate` command: both sides play the same challenge in this process until it is
/// resolved, then the outcome is printed as JSON.
async fn simulate(config: DriverConfig, plan: SimulationPlan) -> Result<()> {
    let config = Arc::new(config);
    let sim = SimBackend::new();
    let backend: Arc<dyn Backend> = Arc::new(sim.clone());

    let honest = AlphabetTrace::honest(b'a', plan.total_steps, TimeBounds::default());
    let faulty = AlphabetTrace::faulty(
        b'a',
        plan.total_steps,
        plan.fault_step,
        TimeBounds::default(),
    );
    let (asserter, challenger) = match plan.faulty {
        Side::Asserter => (faulty, honest),
        Side::Challenger => (honest, faulty),
    };

    let claim = SegmentClaim {
        precondition: asserter.precondition(0)?,
        assertion: asserter.assertion(StepRange::new(0, plan.total_steps))?,
    };
    let opened_at = sim
        .open_execution_challenge(
            SIM_CONTRACT,
            config.challenge,
            claim,
            plan.total_steps,
            Arc::new(AlphabetVerifier),
        )
        .await?;

    let disputes = ActiveDisputes::new();
    let (shutdown, _) = broadcast::channel(1);
    let player = Player {
        config: &config,
        backend: &backend,
        disputes: &disputes,
        claim,
        total_steps: plan.total_steps,
        opened_at,
        shutdown: &shutdown,
    };
    let mut outcome = player.spawn(Party::Challenger, challenger)?;
    if !plan.silent_asserter {
        player.spawn(Party::Asserter, asserter)?;
    }

    let mut miner = tokio::time::interval(plan.block_time);
    let resolved = loop {
        tokio::select! {
            _ = miner.tick() => {
                sim.mine_block().await;
            }
            changed = outcome.changed() => {
                changed?;
                if let Some(resolved) = *outcome.borrow() {
                    break resolved;
                }
            }
        }
    };
    let _ = shutdown.send(());

    let head = sim.current_block_identity().await?;
    let report = json!({
        "outcome": resolved,
        "opened_at": opened_at.height,
        "resolved_by": head.height,
        "total_steps": plan.total_steps,
        "fault_step": plan.fault_step,
        "contract_phase": sim.challenge_phase(SIM_CONTRACT).await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Everything a simulated participant is spawned from.
struct Player<'a> {
    config: &'a Arc<DriverConfig>,
    backend: &'a Arc<dyn Backend>,
    disputes: &'a ActiveDisputes,
    claim: SegmentClaim,
    total_steps: u64,
    opened_at: BlockIdentity,
    shutdown: &'a broadcast::Sender<()>,
}

impl Player<'_> {
    /// Spawns a [DisputeDriver] playing `role` from `trace` and returns its outcome receiver.
    fn spawn(&self, role: Party, trace: AlphabetTrace) -> Result<watch::Receiver<Option<Outcome>>> {
        let challenge = BisectionChallenge::new(
            self.config.challenge,
            self.total_steps,
            self.opened_at.ticks(),
            Arc::new(AlphabetVerifier),
        )?
        .with_claim(self.claim);
        let session = ChallengeSession::open(
            self.disputes,
            SIM_CONTRACT,
            role,
            Arc::clone(self.backend),
            challenge,
            self.opened_at,
        )?;
        let outcome = session.subscribe_outcome();

        let watcher = EventWatcher::new(
            SIM_CONTRACT,
            ExecutionDecoder::default(),
            Arc::clone(self.backend),
            self.config,
        );
        let driver = DisputeDriver::new(
            session,
            watcher,
            Arc::new(AlphabetSolver::new(trace)),
            self.shutdown.clone(),
        );
        tokio::spawn(async move {
            if let Err(err) = driver.start_loop().await {
                tracing::error!(target: "rollup-challenger-cli", "The {} driver failed: {}", role, err);
            }
        });
        Ok(outcome)
    }
}

/// Initializes the tracing subscriber
///
/// # Arguments
/// * `verbosity_level` - The verbosity level (0-4)
///
/// # Returns
/// * `Result<()>` - Ok if successful, Err otherwise.
fn init_tracing_subscriber(verbosity_level: u8) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(match verbosity_level {
            0 => Level::ERROR,
            1 => Level::WARN,
            2 => Level::INFO,
            3 => Level::DEBUG,
            _ => Level::TRACE,
        })
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow!(e))
}
