use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

mod commands;

use commands::{OutputFormat, Session};

#[derive(Parser)]
#[command(
    name = "hvres",
    about = "hvres — reconcile VM memory, processor and CPU-group settings",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Host snapshot file (management objects).
    #[arg(long, global = true, default_value = "hvres-host.json")]
    host: PathBuf,

    /// CPU-group table file. Defaults to the host snapshot with a
    /// `.groups.json` extension.
    #[arg(long, global = true)]
    groups: Option<PathBuf>,

    /// Service tuning (poll interval, job timeout) as TOML.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format.
    #[arg(short, long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a host snapshot with the given VMs
    Host {
        #[command(subcommand)]
        action: HostAction,
    },
    /// Read or reconcile a VM's memory settings
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Read or reconcile a VM's processor settings
    Processor {
        #[command(subcommand)]
        action: ProcessorAction,
    },
    /// Manage CPU groups and VM bindings
    CpuGroup {
        #[command(subcommand)]
        action: CpuGroupAction,
    },
    /// VM identity and power state
    Vm {
        #[command(subcommand)]
        action: VmAction,
    },
    /// Host-wide NUMA spanning
    Numa {
        #[command(subcommand)]
        action: NumaAction,
    },
}

#[derive(Subcommand)]
enum HostAction {
    /// Write a fresh snapshot to --host
    Init {
        /// VM names to create (stopped).
        #[arg(long = "vm")]
        vms: Vec<String>,
        /// VM names to create running.
        #[arg(long = "running")]
        running: Vec<String>,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    Get {
        vm: String,
    },
    /// Apply the [memory] table of a desired-state file
    Set {
        vm: String,
        /// Desired-state TOML file.
        #[arg(short, long)]
        desired: PathBuf,
        /// Treat the VM as running (hot path). Read from the host when omitted.
        #[arg(long)]
        running: Option<bool>,
    },
}

#[derive(Subcommand)]
enum ProcessorAction {
    Get {
        vm: String,
    },
    /// Apply the [processor] table of a desired-state file
    Set {
        vm: String,
        #[arg(short, long)]
        desired: PathBuf,
    },
}

#[derive(Subcommand)]
enum CpuGroupAction {
    List,
    Create {
        /// Group id. A random one is generated when omitted.
        #[arg(long)]
        id: Option<Uuid>,
        /// Logical processor indices, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        processors: Vec<u32>,
        #[arg(long)]
        cap: Option<u16>,
    },
    Delete {
        id: Uuid,
    },
    /// Set a group's capacity cap (0-65535)
    Cap {
        id: Uuid,
        cap: u16,
    },
    Bind {
        vm: String,
        group: Uuid,
    },
    Unbind {
        vm: String,
    },
    /// Show the group a VM is bound to
    Show {
        vm: String,
    },
}

#[derive(Subcommand)]
enum VmAction {
    Rename {
        id: Uuid,
        name: String,
    },
    /// Report whether a VM is running
    State {
        vm: String,
    },
}

#[derive(Subcommand)]
enum NumaAction {
    Get,
    Set {
        #[arg(action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hvres=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Host {
        action: HostAction::Init { vms, running },
    } = &cli.command
    {
        return commands::host::init(&cli.host, cli.groups.as_deref(), vms, running, cli.format);
    }

    let session = Session::open(&cli.host, cli.groups.as_deref(), cli.config.as_deref(), cli.format)?;

    match cli.command {
        Commands::Host { .. } => Ok(()),
        Commands::Memory { action } => match action {
            MemoryAction::Get { vm } => commands::memory::get(&session, &vm).await,
            MemoryAction::Set {
                vm,
                desired,
                running,
            } => commands::memory::set(&session, &vm, &desired, running).await,
        },
        Commands::Processor { action } => match action {
            ProcessorAction::Get { vm } => commands::processor::get(&session, &vm).await,
            ProcessorAction::Set { vm, desired } => {
                commands::processor::set(&session, &vm, &desired).await
            }
        },
        Commands::CpuGroup { action } => match action {
            CpuGroupAction::List => commands::cpu_group::list(&session).await,
            CpuGroupAction::Create {
                id,
                processors,
                cap,
            } => commands::cpu_group::create(&session, id, processors, cap).await,
            CpuGroupAction::Delete { id } => commands::cpu_group::delete(&session, id).await,
            CpuGroupAction::Cap { id, cap } => commands::cpu_group::cap(&session, id, cap).await,
            CpuGroupAction::Bind { vm, group } => {
                commands::cpu_group::bind(&session, &vm, group).await
            }
            CpuGroupAction::Unbind { vm } => commands::cpu_group::unbind(&session, &vm).await,
            CpuGroupAction::Show { vm } => commands::cpu_group::show(&session, &vm).await,
        },
        Commands::Vm { action } => match action {
            VmAction::Rename { id, name } => commands::vm::rename(&session, id, &name).await,
            VmAction::State { vm } => commands::vm::state(&session, &vm).await,
        },
        Commands::Numa { action } => match action {
            NumaAction::Get => commands::vm::numa_get(&session).await,
            NumaAction::Set { enabled } => commands::vm::numa_set(&session, enabled).await,
        },
    }
}
