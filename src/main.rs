use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use codepatch::{Config, EntryType, GitRepository, Patch, PatchManager};
use colored::Colorize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "codepatch")]
#[command(author, version, about = "Layered patches over published code in a git repository")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Config file (default: nearest .codepatch/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Git repository holding the published code (overrides config)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Branch whose head is the starting point (overrides config)
    #[arg(long, global = true)]
    branch: Option<String>,

    /// Print JSON instead of text where supported
    #[arg(long, global = true)]
    json: bool,

    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the root patch for the branch head, creating it if needed
    Head,

    /// List recently modified patches
    List {
        /// Maximum number of patches (default from config)
        #[arg(short = 'n', long)]
        limit: Option<i64>,
    },

    /// Show a patch and the files it changes
    Show { patch: i32 },

    /// Create a new patch on top of BASE (default: the branch head)
    New {
        base: Option<i32>,

        /// Title instead of "New Patch"
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Change a patch's title and/or metadata
    Rename {
        patch: i32,

        title: Option<String>,

        /// Metadata as a JSON object
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Move a patch onto a different base
    Rebase { patch: i32, base: i32 },

    /// List a directory as seen through a patch
    Ls {
        patch: i32,

        /// Directory path (default: repository root)
        path: Option<String>,
    },

    /// Print a file as seen through a patch
    Cat {
        patch: i32,

        filename: String,

        /// Print the text from the patch's base instead
        #[arg(long)]
        base: bool,
    },

    /// Open a file for editing in a patch and print the change id
    Edit { patch: i32, filename: String },

    /// Save new text for a change (from --file, or stdin)
    Write {
        patch: i32,

        change: i32,

        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Add a new file to a patch (text from --file, or stdin)
    Add {
        patch: i32,

        filename: String,

        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Render text as HTML through the render service (from --file, or stdin)
    Render {
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Generate shell completions
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Command::Completion { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "codepatch", &mut io::stdout());
        return;
    }

    if let Err(e) = run(cli) {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "codepatch=warn",
        1 => "codepatch=info",
        _ => "codepatch=debug",
    };
    let filter = EnvFilter::try_from_env("CODEPATCH_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(repo) = &cli.repo {
        // relative to where the command runs, not to the config file
        config.repository.path = std::env::current_dir()?.join(repo);
    }
    if let Some(branch) = &cli.branch {
        config.repository.branch = branch.clone();
    }
    Ok(config)
}

/// Text from a file, or stdin when none is given
fn read_input(file: Option<&PathBuf>) -> io::Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut text = String::new();
            io::stdin().read_to_string(&mut text)?;
            Ok(text)
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn patch_line(patch: &Patch) -> String {
    let origin = match (&patch.base_patch_id, &patch.commit_hash) {
        (Some(base), _) => format!("on #{}", base),
        (None, Some(hash)) => format!("@ {}", codepatch::model::short_hash(hash)),
        (None, None) => String::new(),
    };
    format!(
        "{}  {}  {}  {}",
        format!("#{}", patch.id).yellow(),
        patch.modified_at.dimmed(),
        patch.display_title().bold(),
        origin.dimmed()
    )
}

fn run(cli: Cli) -> CliResult {
    let config = load_config(&cli)?;
    let manager = PatchManager::open(config)?;
    let json = cli.json;

    match cli.command {
        Command::Head => {
            let root = manager.open_head()?;
            if json {
                return print_json(&root);
            }
            let info = manager.display_info(&root)?;
            println!("{} {}", format!("#{}", root.id).yellow(), info.title.bold());
            println!("{}", info.description);
        }

        Command::List { limit } => {
            let patches = manager.recent_patches(limit)?;
            if json {
                return print_json(&patches);
            }
            if patches.is_empty() {
                println!("No patches yet. Run {} to start one.", "codepatch new".cyan());
            }
            for patch in &patches {
                println!("{}", patch_line(patch));
            }
        }

        Command::Show { patch } => show(&manager, patch, json)?,

        Command::New { base, title } => {
            let base_id = match base {
                Some(id) => id,
                None => manager.open_head()?.id,
            };
            let mut patch = manager.new_patch(base_id)?;
            if let Some(title) = title {
                patch = manager.update_details(patch.id, Some(&title), None)?;
            }
            if json {
                return print_json(&patch);
            }
            println!("{} {}", "Created".green(), patch_line(&patch));
        }

        Command::Rename { patch, title, metadata } => {
            let metadata: Option<serde_json::Value> = metadata.as_deref().map(serde_json::from_str).transpose()?;
            let patch = manager.update_details(patch, title.as_deref(), metadata.as_ref())?;
            println!("{} {}", "Updated".green(), patch_line(&patch));
        }

        Command::Rebase { patch, base } => {
            let patch = manager.rebase_patch(patch, base)?;
            println!("{} {}", "Rebased".green(), patch_line(&patch));
        }

        Command::Ls { patch, path } => {
            let patch = manager.get_patch(patch)?;
            let entries = manager.list_files(&patch, path.as_deref())?;
            if json {
                return print_json(&entries);
            }
            for entry in &entries {
                match entry.entry_type {
                    EntryType::Dir => println!("{}/", entry.name.blue().bold()),
                    EntryType::File => println!("{}", entry.name),
                }
            }
        }

        Command::Cat { patch, filename, base } => {
            let mut patch = manager.get_patch(patch)?;
            if base {
                let base_id = patch
                    .base_patch_id
                    .ok_or_else(|| codepatch::PatchError::invalid("Root patches have no base."))?;
                patch = manager.get_patch(base_id)?;
            }
            let bytes = manager.get_content(&patch, &filename)?;
            io::stdout().write_all(&bytes)?;
        }

        Command::Edit { patch, filename } => {
            let change = manager.open_change(patch, &filename)?;
            if json {
                return print_json(&change);
            }
            println!("{}", change.id);
        }

        Command::Write { patch, change, file } => {
            let text = read_input(file.as_ref())?;
            let change = manager.update_change(patch, change, &text)?;
            println!("{} {} ({} bytes)", "Saved".green(), change.filename, text.len());
        }

        Command::Add { patch, filename, file } => {
            let text = read_input(file.as_ref())?;
            let change = manager.add_file(patch, &filename, &text)?;
            if json {
                return print_json(&change);
            }
            println!("{} {} as change {}", "Added".green(), change.filename, change.id);
        }

        Command::Render { file } => {
            let text = read_input(file.as_ref())?;
            let html = manager.render_body(&text)?;
            println!("{}", html);
        }

        // handled before the manager is opened
        Command::Completion { .. } => {}
    }

    Ok(())
}

fn show(manager: &PatchManager<GitRepository>, patch_id: i32, json: bool) -> CliResult {
    let patch = manager.get_patch(patch_id)?;
    let changes = manager.changed_files(patch.id)?;

    if json {
        return print_json(&serde_json::json!({
            "patch": patch,
            "info": manager.display_info(&patch)?,
            "changes": changes,
        }));
    }

    let info = manager.display_info(&patch)?;
    println!("{}", patch_line(&patch));
    if !info.description.is_empty() {
        println!("\n{}", info.description);
    }
    let metadata = patch.metadata();
    if metadata.as_object().is_some_and(|m| !m.is_empty()) {
        println!("\n{} {}", "Metadata:".bold(), metadata);
    }

    if patch.is_root() {
        return Ok(());
    }
    println!("\n{}", "Changed files:".bold());
    if changes.is_empty() {
        println!("  (none)");
    }
    for change in &changes {
        println!("  {}  {}", format!("{:>4}", change.id).yellow(), change.filename);
    }
    Ok(())
}
