use std::{hint::black_box, time::Duration};

use algloop::{
    BlockError, CollectingSink, EquationBlock, ExitCriterion, JacobianMode, JacobianUpdate,
    ResidualScaling, Severity, SolveReport, SolverConfig, SolverKind,
};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use colored::Colorize;

use crate::demos::{CATALOGUE, Demo, DemoResidual};

mod demos;

const NUM_ITERS_BENCHMARK: u32 = 100;

#[derive(Parser)]
#[command(name = "algloop", version, about, long_about = None)]
struct Cli {
    /// Loops to solve. Solves every built-in loop when empty.
    demos: Vec<String>,

    /// List the built-in loops and exit.
    #[arg(long)]
    list: bool,

    /// Solver back-end.
    #[arg(long, value_enum, default_value_t = Backend::Newton)]
    solver: Backend,

    /// How a fresh Jacobian is computed.
    #[arg(long, value_enum, default_value_t = JacobianArg::Forward)]
    jacobian: JacobianArg,

    /// How the Jacobian is maintained between fresh evaluations.
    #[arg(long, value_enum, default_value_t = UpdateArg::Full)]
    update: UpdateArg,

    /// Residual scaling policy.
    #[arg(long, value_enum, default_value_t = ScalingArg::Auto)]
    scaling: ScalingArg,

    /// When Newton iteration stops.
    #[arg(long, value_enum, default_value_t = ExitArg::Both)]
    exit: ExitArg,

    /// Residual / step tolerance.
    #[arg(long)]
    tolerance: Option<f64>,

    /// Newton iterations per attempt.
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Let iterates leave min/max.
    #[arg(long)]
    no_bounds: bool,

    /// Disable Brent refinement for one unknown.
    #[arg(long)]
    no_brent: bool,

    /// Print every solver event.
    #[arg(long)]
    events: bool,

    /// Print one line per Newton iteration.
    #[arg(long)]
    trace: bool,

    /// Time each successful loop, averaged over fresh solves.
    #[arg(long)]
    bench: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    Newton,
    SimpleNewton,
    Linear,
}

#[derive(Clone, Copy, ValueEnum)]
enum JacobianArg {
    Forward,
    Central,
    CentralAtBound,
    External,
    Compression,
}

#[derive(Clone, Copy, ValueEnum)]
enum UpdateArg {
    Full,
    Reuse,
    Broyden,
    SparseBroyden,
    ModifiedBfgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum ScalingArg {
    None,
    Manual,
    Auto,
    Aggressive,
    FullJacobian,
    Hybrid,
}

#[derive(Clone, Copy, ValueEnum)]
enum ExitArg {
    Step,
    Residual,
    Both,
}

impl Cli {
    fn config(&self) -> SolverConfig {
        let mut config = SolverConfig::default()
            .with_solver_kind(match self.solver {
                Backend::Newton => SolverKind::Newton,
                Backend::SimpleNewton => SolverKind::SimpleNewton,
                Backend::Linear => SolverKind::Linear,
            })
            .with_jacobian_mode(match self.jacobian {
                JacobianArg::Forward => JacobianMode::ForwardDifference,
                JacobianArg::Central => JacobianMode::CentralDifference,
                JacobianArg::CentralAtBound => JacobianMode::CentralAtBound,
                JacobianArg::External => JacobianMode::External,
                JacobianArg::Compression => JacobianMode::Compression,
            })
            .with_jacobian_update(match self.update {
                UpdateArg::Full => JacobianUpdate::Full,
                UpdateArg::Reuse => JacobianUpdate::Reuse,
                UpdateArg::Broyden => JacobianUpdate::Broyden,
                UpdateArg::SparseBroyden => JacobianUpdate::SparseBroyden,
                UpdateArg::ModifiedBfgs => JacobianUpdate::ModifiedBfgs,
            })
            .with_residual_scaling(match self.scaling {
                ScalingArg::None => ResidualScaling::None,
                ScalingArg::Manual => ResidualScaling::Manual,
                ScalingArg::Auto => ResidualScaling::Auto,
                ScalingArg::Aggressive => ResidualScaling::AggressiveAuto,
                ScalingArg::FullJacobian => ResidualScaling::FullJacobianAuto,
                ScalingArg::Hybrid => ResidualScaling::Hybrid,
            })
            .with_exit_criterion(match self.exit {
                ExitArg::Step => ExitCriterion::Step,
                ExitArg::Residual => ExitCriterion::Residual,
                ExitArg::Both => ExitCriterion::StepAndResidual,
            })
            .with_enforce_bounds(!self.no_bounds)
            .with_brent_in_1d(!self.no_brent);
        if let Some(tolerance) = self.tolerance {
            config = config.with_tolerance(tolerance);
        }
        if let Some(max_iterations) = self.max_iterations {
            config = config.with_max_iterations(max_iterations);
        }
        config
    }

    fn selected(&self) -> anyhow::Result<Vec<&'static Demo>> {
        if self.demos.is_empty() {
            return Ok(CATALOGUE.iter().collect());
        }
        self.demos
            .iter()
            .map(|name| {
                Demo::find(name).with_context(|| format!("unknown loop '{name}', see --list"))
            })
            .collect()
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    match main_inner(&cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(2);
        }
    }
}

/// Solves the selected loops. `Ok(false)` if any of them did not converge.
fn main_inner(cli: &Cli) -> anyhow::Result<bool> {
    if cli.list {
        for demo in CATALOGUE {
            println!("{:<12} {} ({} unknowns)", demo.name.bold(), demo.description, demo.n);
        }
        return Ok(true);
    }
    let config = cli.config();
    let mut all_converged = true;
    for demo in cli.selected()? {
        all_converged &= run_demo(cli, demo, &config)?;
    }
    Ok(all_converged)
}

type DemoBlock = EquationBlock<DemoResidual>;

fn build_block(demo: &'static Demo, config: &SolverConfig, sink: CollectingSink) -> anyhow::Result<DemoBlock> {
    let block = EquationBlock::new(demo.name, demo.n, demo.residual_fn(), config.clone())
        .with_context(|| format!("could not build loop '{}'", demo.name))?
        .with_log_sink(sink);
    Ok(block)
}

fn run_demo(cli: &Cli, demo: &'static Demo, config: &SolverConfig) -> anyhow::Result<bool> {
    println!("{} {}", demo.name.bold(), format!("({})", demo.description).dimmed());
    let sink = CollectingSink::default();
    let mut block = build_block(demo, config, sink.clone())?;
    let outcome = block.solve();
    if cli.events {
        print_events(&sink);
    }
    let converged = match outcome {
        Ok(report) => {
            print_report(&block, &report, cli.trace);
            if cli.bench {
                let duration = bench(demo, config)?;
                print_performance(duration);
            }
            true
        }
        Err(BlockError::ConvergenceFailure(failure)) => {
            eprintln!("\t{}: {}", "Did not converge".red(), failure.reason);
            println!(
                "\tresidual {:.3e}, step {:.3e} after {} iterations",
                failure.residual_norm, failure.step_norm, failure.iterations
            );
            print_solution(block.x());
            false
        }
        Err(e) => return Err(e).with_context(|| format!("loop '{}' failed", demo.name)),
    };
    println!();
    Ok(converged)
}

fn print_report(block: &DemoBlock, report: &SolveReport, trace: bool) {
    let counters = block.counters();
    println!(
        "\t{} in {} iterations ({} attempts), residual {:.3e}",
        "Converged".green(),
        report.iterations(),
        report.attempts(),
        report.residual_norm()
    );
    println!(
        "\t{} residual evaluations, {} Jacobians{}",
        counters.residual_evaluations,
        counters.jacobian_evaluations,
        if report.used_brent() { ", refined by Brent" } else { "" }
    );
    if trace {
        for it in report.trace() {
            println!(
                "\t{:>3}  |F| {:.3e}  |dx| {:.3e}  λ {:.3}  {:?}{}",
                it.iteration,
                it.residual_norm,
                it.step_norm,
                it.damping,
                it.step_kind,
                if it.fresh_jacobian { "" } else { " (old J)" }
            );
        }
    }
    print_solution(block.x());
}

fn print_solution(x: &[f64]) {
    for (i, xi) in x.iter().enumerate() {
        println!("\tx[{i}] = {xi:.12}");
    }
}

fn print_events(sink: &CollectingSink) {
    for event in sink.events() {
        let tag = match event.severity {
            Severity::Info => event.category.normal(),
            Severity::Warning => event.category.yellow(),
            Severity::Error => event.category.red(),
        };
        println!("\t[{tag}] {}", event.message);
    }
}

/// Mean time of a fresh solve of `demo`.
fn bench(demo: &'static Demo, config: &SolverConfig) -> anyhow::Result<Duration> {
    let now = std::time::Instant::now();
    for _ in 0..NUM_ITERS_BENCHMARK {
        let mut block = build_block(demo, config, CollectingSink::default())?;
        black_box(block.solve())?;
    }
    Ok(now.elapsed() / NUM_ITERS_BENCHMARK)
}

fn print_performance(duration: Duration) {
    let time = format!("{}μs", duration.as_micros());
    println!("\tSolved in {time} (mean over {NUM_ITERS_BENCHMARK} iterations)");
}
