use std::path::Path;

use console::Style;
use slotphot_core::pipeline::{ConvergenceConfig, PipelineConfig, PipelineSummary};
use slotphot_core::pipeline::convergence::round_gof;

struct Styles {
    title: Style,
    header: Style,
    label: Style,
    value: Style,
    method: Style,
    disabled: Style,
    path: Style,
    bad: Style,
}

impl Styles {
    fn new() -> Self {
        Self {
            title: Style::new().cyan().bold(),
            header: Style::new().cyan().bold(),
            label: Style::new().dim(),
            value: Style::new().bold().white(),
            method: Style::new().green(),
            disabled: Style::new().dim().yellow(),
            path: Style::new().underlined(),
            bad: Style::new().red(),
        }
    }
}

fn rule(n: usize) -> String {
    "\u{2550}".repeat(n)
}

pub fn print_config_summary(
    config: &PipelineConfig,
    input: &Path,
    n_frames: usize,
    frame_shape: (usize, usize),
) {
    let s = Styles::new();

    println!();
    println!("  {}", s.title.apply_to("Slot-mode Pipeline"));
    println!("  {}", s.title.apply_to(rule(18)));
    println!();

    println!(
        "  {:<14}{}",
        s.label.apply_to("Input"),
        s.path.apply_to(input.display())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Results"),
        s.path.apply_to(config.results.display())
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("Frames"),
        s.value.apply_to(format!(
            "{} of {}x{}",
            n_frames, frame_shape.1, frame_shape.0
        ))
    );
    let workers = if config.n_workers == 0 {
        "all cores".to_string()
    } else {
        config.n_workers.to_string()
    };
    println!(
        "  {:<14}{}",
        s.label.apply_to("Workers"),
        s.value.apply_to(workers)
    );
    println!();

    println!("  {}", s.header.apply_to("Background"));
    println!(
        "    {:<14}{:?} x {:?}",
        s.label.apply_to("Orders"),
        config.background.orders_y,
        config.background.orders_x
    );
    println!(
        "    {:<14}{}",
        s.label.apply_to("Sample size"),
        s.value.apply_to(format!("{} frames", config.sampling.n_comb))
    );
    println!(
        "    {:<14}{}",
        s.label.apply_to("Knot search"),
        s.value
            .apply_to(format!("every {} frames", config.background.knot_search_every))
    );
    println!();

    println!("  {}", s.header.apply_to("Detection"));
    println!(
        "    {:<14}{}",
        s.label.apply_to("SNR"),
        s.value.apply_to(config.detection.snr)
    );
    let stop = match config.convergence {
        ConvergenceConfig::FixedRounds { rounds } => format!("{rounds} rounds"),
        ConvergenceConfig::GofStabilized {
            epsilon,
            max_rounds,
            ..
        } => format!("gof change < {epsilon}, at most {max_rounds} rounds"),
    };
    println!(
        "    {:<14}{}",
        s.label.apply_to("Stop"),
        s.method.apply_to(stop)
    );
    println!(
        "    {:<14}{}",
        s.label.apply_to("Failure cap"),
        s.value.apply_to(config.failure_cap)
    );
    if config.clobber {
        println!(
            "    {:<14}{}",
            s.label.apply_to("Resume"),
            s.disabled.apply_to("disabled (clobber)")
        );
    }
    println!();
}

pub fn print_run_summary(summary: &PipelineSummary, config: &PipelineConfig) {
    let s = Styles::new();

    println!();
    println!("  {}", s.title.apply_to("Summary"));
    println!("  {}", s.title.apply_to(rule(7)));
    println!();

    if summary.resumed {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Resumed"),
            s.method.apply_to(format!("{:?} tracker", summary.stage))
        );
    }
    for round in &summary.rounds {
        println!(
            "  {} {}  {}",
            s.header.apply_to(format!("Round {}", round.round)),
            s.label.apply_to(format!("({:.1}s)", round.elapsed.as_secs_f64())),
            s.value.apply_to(format!(
                "median gof {:.4}, {} objects, {} bright",
                round_gof(&round.gof.iter().map(|(_, g)| *g).collect::<Vec<_>>()),
                round.n_objects,
                round.n_bright
            ))
        );
        for (sample, gof) in &round.gof {
            if gof.is_finite() {
                println!("    {:<10}{:.4}", s.label.apply_to(sample), gof);
            } else {
                println!("    {:<10}{}", s.label.apply_to(sample), s.bad.apply_to("failed"));
            }
        }
    }
    println!();

    println!(
        "  {:<14}{}",
        s.label.apply_to("Objects"),
        s.value.apply_to(format!(
            "{} ({} bright)",
            summary.n_objects, summary.n_bright
        ))
    );
    if let Some(tracked) = summary.tracked_frames {
        println!(
            "  {:<14}{}",
            s.label.apply_to("Tracked"),
            s.value
                .apply_to(format!("{} of {} frames", tracked, summary.n_frames))
        );
    }
    for task in &summary.tasks {
        if task.size == 0 && task.successes == 0 && task.failures == 0 {
            continue;
        }
        let style = if task.failures > 0 { &s.bad } else { &s.value };
        println!(
            "  {:<14}{}",
            s.label.apply_to(&task.name),
            style.apply_to(format!("{} ok, {} failed", task.successes, task.failures))
        );
    }
    println!(
        "  {:<14}{}",
        s.label.apply_to("Elapsed"),
        s.value
            .apply_to(format!("{:.1}s", summary.elapsed.as_secs_f64()))
    );
    println!(
        "  {:<14}{}",
        s.label.apply_to("State"),
        s.path.apply_to(config.results.display())
    );
    println!();
}
