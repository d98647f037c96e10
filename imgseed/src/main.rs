use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use imgseed_core::error::BuildError;
use imgseed_core::exec::Executor;
use imgseed_core::host::LinuxHost;
use imgseed_core::orchestrator::{self, BuildReport, BuildRequest, Orchestrator};
use imgseed_core::pipeline::{self, Toolbox};
use imgseed_core::poll::PollPolicy;
use imgseed_core::preflight;
use imgseed_core::resources::Resources;
use imgseed_core::stage::StageRegistry;
use imgseed_core::status::StatusStore;
use imgseed_core::target::{
    BuildTarget, BuildTargetOptions, DEFAULT_ARCH, DEFAULT_DISTRIBUTION, DEFAULT_HOSTNAME,
    DEFAULT_IMAGE_NAME, DEFAULT_MIRROR, KernelMethod, MIN_SIZE_MB,
};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgseed")]
#[command(about = "Build bootable Raspberry Pi 2 images in resumable stages", version)]
#[command(
    after_help = "Only one imgseed process may work on a given image at a time; nothing enforces this."
)]
struct Cli {
    /// Increase logging verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an image, resuming where a previous run stopped
    Image(ImageArgs),
    /// Show an image's build status
    Info {
        #[command(flatten)]
        target: TargetArgs,

        /// List every stage level
        #[arg(short, long)]
        levels: bool,
    },
    /// Unmount an image and release its loop devices
    Detach {
        #[command(flatten)]
        target: TargetArgs,

        /// Also delete the image and its status file
        #[arg(long)]
        purge: bool,

        /// Don't ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Attach and mount an image without running any stage
    Attach {
        #[command(flatten)]
        target: TargetArgs,

        /// Open a shell chrooted into the mounted image
        #[arg(long)]
        shell: bool,
    },
    /// Show or verify the host tools a build needs
    Setup {
        /// Check that every tool is installed
        #[arg(long)]
        check: bool,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Path to the image file
    #[arg(short, long = "image-path", env = "IMGSEED_IMAGE", default_value = DEFAULT_IMAGE_NAME)]
    image: PathBuf,

    /// Where to mount the image [default: <image>.mnt]
    #[arg(long, env = "IMGSEED_MOUNT_ROOT")]
    mount_root: Option<PathBuf>,
}

impl TargetArgs {
    fn options(&self) -> BuildTargetOptions {
        let mut opts = BuildTargetOptions::new(&self.image);
        opts.mount_root = self.mount_root.clone();
        opts
    }
}

#[derive(Args)]
struct ImageArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Size of a new image in megabytes
    #[arg(short, long, default_value_t = MIN_SIZE_MB)]
    size: u64,

    /// Debian suite to bootstrap
    #[arg(short, long, default_value = DEFAULT_DISTRIBUTION)]
    distribution: String,

    /// How to obtain the kernel
    #[arg(short, long, value_enum, default_value_t = KernelArg::Prebuilt)]
    kernel: KernelArg,

    /// Directory copied onto the root filesystem
    #[arg(short, long = "overlay-directory")]
    overlay: Option<PathBuf>,

    /// Stop after this stage level
    #[arg(short, long)]
    level: Option<u32>,

    /// Delete an existing image and start over
    #[arg(short, long)]
    force: bool,

    /// Show which stages would run without running them
    #[arg(short = 'n', long)]
    dry_run: bool,

    #[arg(long, env = "IMGSEED_HOSTNAME", default_value = DEFAULT_HOSTNAME)]
    hostname: String,

    #[arg(long, default_value = DEFAULT_ARCH)]
    arch: String,

    /// Debian mirror for debootstrap and apt
    #[arg(long, env = "IMGSEED_MIRROR", default_value = DEFAULT_MIRROR)]
    mirror: String,

    /// Where kernel sources and firmware are downloaded [default: ./dependencies]
    #[arg(long, env = "IMGSEED_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Don't ask for confirmation
    #[arg(short, long)]
    yes: bool,

    /// Fail when a mountpoint is occupied by an unexpected device
    #[arg(long)]
    strict_mounts: bool,

    /// How many times to look for partition device nodes
    #[arg(long)]
    poll_attempts: Option<u32>,

    /// Initial delay between looks, in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,
}

impl ImageArgs {
    fn options(&self) -> BuildTargetOptions {
        let mut opts = self.target.options();
        opts.size_mb = Some(self.size);
        opts.distribution = self.distribution.clone();
        opts.kernel = self.kernel.into();
        opts.overlay = self.overlay.clone();
        opts.hostname = self.hostname.clone();
        opts.arch = self.arch.clone();
        opts.mirror = self.mirror.clone();
        opts.work_dir = self.work_dir.clone();
        opts
    }

    fn poll_policy(&self) -> PollPolicy {
        let mut policy = PollPolicy::default();
        if let Some(attempts) = self.poll_attempts {
            policy.attempts = attempts;
        }
        if let Some(ms) = self.poll_interval_ms {
            policy.interval = Duration::from_millis(ms);
        }
        policy
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KernelArg {
    /// Packaged kernel from a vendor repository
    Prebuilt,
    /// Cross-compile a kernel.org release
    Mainline,
    /// Cross-compile the Raspberry Pi Foundation tree
    Rpi,
}

impl From<KernelArg> for KernelMethod {
    fn from(arg: KernelArg) -> Self {
        match arg {
            KernelArg::Prebuilt => KernelMethod::Prebuilt,
            KernelArg::Mainline => KernelMethod::Mainline,
            KernelArg::Rpi => KernelMethod::Rpi,
        }
    }
}

fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

/// The real host: commands go through the shell, mounts through mount(2).
fn host_resources(policy: PollPolicy, strict_mounts: bool) -> (Arc<Executor>, Arc<Resources>) {
    let runner = Arc::new(Executor::new());
    let host = Arc::new(LinuxHost::new(runner.clone()));
    let resources = Resources::new(host)
        .with_poll(policy)
        .strict_mounts(strict_mounts);
    (runner, Arc::new(resources))
}

fn registry_for(runner: Arc<Executor>, resources: Arc<Resources>) -> StageRegistry {
    pipeline::standard_stages(Toolbox::new(runner, resources))
}

/// Explains a failed build: which stage, which command, and what it printed.
fn print_failure(err: &BuildError) {
    match err {
        BuildError::Stage { level, name, .. } => {
            eprintln!("{} stage {} ({}) failed.", style("FAILED:").red().bold(), level, name);
        }
        BuildError::Interrupted { level } => {
            eprintln!(
                "{} stopped after level {}. Run the same command again to resume.",
                style("INTERRUPTED:").yellow().bold(),
                level
            );
        }
        _ => {}
    }
    if let Some((command, output)) = BuildError::find_command_failure(err) {
        eprintln!("  Command: {}", style(command).cyan());
        if !output.is_empty() {
            eprintln!("  Output:");
            for line in output.lines() {
                eprintln!("    {line}");
            }
        }
    }
}

fn print_report(report: &BuildReport, target: &BuildTarget, final_level: u32) {
    if report.stages.is_empty() {
        println!(
            "Nothing to do: {} is already at level {}.",
            style(target.image().display()).cyan(),
            report.start_level
        );
        return;
    }
    if report.dry_run {
        println!("Would run:");
        for (level, name) in &report.stages {
            println!("  [{level}/{final_level}] {name}");
        }
        return;
    }
    println!(
        "\n✨ {} is now at level {}/{}.",
        style(target.image().display()).cyan(),
        report.finish_level,
        final_level
    );
}

fn run_image(args: ImageArgs, interrupt: Arc<AtomicBool>) -> Result<()> {
    let target = BuildTarget::new(args.options())?;

    if !args.dry_run {
        preflight::check_root()?;
        preflight::check_required_tools(&preflight::tools_for(target.kernel()))?;
    }

    if args.force && !args.dry_run && target.exists() && !args.yes {
        println!(
            "{} This will delete '{}' and rebuild it from scratch.",
            style("WARNING:").red().bold(),
            target.image().display()
        );
        if !confirm_operation("Are you sure you want to proceed?")? {
            println!("Build cancelled.");
            return Ok(());
        }
    }

    let (runner, resources) = host_resources(args.poll_policy(), args.strict_mounts);
    let registry = registry_for(runner, resources.clone());
    let final_level = registry.final_level();
    let request = BuildRequest {
        finish_level: args.level,
        overwrite: args.force,
        dry_run: args.dry_run,
    };

    println!("{}", target);
    println!();

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {prefix:.bold} {msg} [{elapsed_precise}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    let result = Orchestrator::new(&registry, &resources)
        .with_interrupt(interrupt)
        .run(
            &target,
            &request,
            |stage| {
                pb.reset_elapsed();
                pb.set_prefix(format!("[{}/{}]", stage.level, final_level));
                pb.set_message(stage.name);
                pb.enable_steady_tick(Duration::from_millis(120));
            },
            |stage, took| {
                pb.println(format!(
                    "{} [{}/{}] {} ({})",
                    style("✔").green(),
                    stage.level,
                    final_level,
                    stage.name,
                    HumanDuration(took)
                ));
            },
        );

    pb.finish_and_clear();
    match result {
        Ok(report) => {
            print_report(&report, &target, final_level);
            Ok(())
        }
        Err(e) => {
            print_failure(&e);
            Err(e.into())
        }
    }
}

fn run_info(target: TargetArgs, levels: bool) -> Result<()> {
    let target = BuildTarget::new(target.options())?;
    let (runner, resources) = host_resources(PollPolicy::default(), false);
    let registry = registry_for(runner, resources);
    let final_level = registry.final_level();

    println!("{}", target);
    let status = StatusStore::new(final_level).read(&target);
    match &status {
        Ok(level) => {
            let last = registry.get(*level).map_or("nothing built yet", |s| s.name);
            println!("  status:       {level}/{final_level} ({last})");
        }
        Err(e) => println!("  status:       {}", style(e).red()),
    }

    if levels {
        println!("\nStages:");
        let done = status.as_ref().map_or(0, |l| *l);
        for stage in registry.iter() {
            let mark = if stage.level <= done {
                style("✔").green()
            } else {
                style("·").dim()
            };
            println!(
                "  {} {:>2}  {:<22} {}",
                mark, stage.level, stage.name, stage.description
            );
        }
    }
    Ok(())
}

fn run_detach(target: TargetArgs, purge: bool, yes: bool) -> Result<()> {
    let target = BuildTarget::new(target.options())?;
    preflight::check_root()?;

    if purge && !yes {
        println!(
            "{} This will delete '{}' and its status file.",
            style("WARNING:").red().bold(),
            target.image().display()
        );
        if !confirm_operation("Are you sure you want to proceed?")? {
            println!("Purge cancelled.");
            return Ok(());
        }
    }

    let (_, resources) = host_resources(PollPolicy::default(), false);
    if purge {
        orchestrator::purge(&resources, &target)?;
        println!("Removed {}.", style(target.image().display()).cyan());
    } else {
        resources.detach_all(target.image(), target.mount_root())?;
        println!("Detached {}.", style(target.image().display()).cyan());
    }
    Ok(())
}

fn run_attach(target: TargetArgs, shell: bool) -> Result<()> {
    let target = BuildTarget::new(target.options())?;
    if !target.exists() {
        return Err(anyhow!("no image at '{}'", target.image().display()));
    }
    preflight::check_root()?;

    let (_, resources) = host_resources(PollPolicy::default(), false);
    let parts = resources.attach_all(target.image(), target.mount_root())?;
    println!(
        "Mounted {} ({}) at {}.",
        style(target.image().display()).cyan(),
        parts.loop_device.display(),
        style(target.mount_root().display()).cyan()
    );

    if shell {
        println!("Opening a shell in the image. It stays mounted after you exit; run `imgseed detach` when done.");
        let status = Command::new("chroot")
            .arg(target.mount_root())
            .arg("/bin/bash")
            .status()
            .context("failed to start chroot shell")?;
        if !status.success() {
            println!("Shell exited with {status}.");
        }
    }
    Ok(())
}

fn run_setup(check: bool) -> Result<()> {
    let mut tools = preflight::REQUIRED_TOOLS.to_vec();
    tools.extend_from_slice(preflight::KERNEL_BUILD_TOOLS);

    if !check {
        let mut packages: Vec<&str> = tools.iter().map(|(_, p)| *p).collect();
        packages.sort_unstable();
        packages.dedup();
        println!("Install the host prerequisites with:\n");
        println!("  apt-get install -y {}", packages.join(" "));
        println!("\nKernel build tools are only needed for --kernel mainline|rpi.");
        return Ok(());
    }

    let missing = preflight::missing_tools(&tools);
    for (tool, package) in &tools {
        if missing.iter().any(|(t, _)| t == tool) {
            println!("  {} {:<26} (install: {})", style("✘").red(), tool, package);
        } else {
            println!("  {} {}", style("✔").green(), tool);
        }
    }
    if missing.is_empty() {
        println!("\nAll host tools are present.");
        Ok(())
    } else {
        Err(anyhow!("{} required host tools are missing", missing.len()))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    // Set on Ctrl+C; the build stops before its next stage.
    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        if !flag.swap(true, Ordering::SeqCst) {
            eprintln!("\nStopping after the current stage...");
        }
    })?;

    match cli.command {
        Commands::Image(args) => run_image(args, interrupt),
        Commands::Info { target, levels } => run_info(target, levels),
        Commands::Detach { target, purge, yes } => run_detach(target, purge, yes),
        Commands::Attach { target, shell } => run_attach(target, shell),
        Commands::Setup { check } => run_setup(check),
    }
}
