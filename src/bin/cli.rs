use anyhow::{anyhow, bail, Context};
use autotss::*;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::time;

/// Manage devices and save SHSH blobs on demand
#[derive(Parser)]
#[clap(name = "autotss-cli", version)]
struct Opts {
    /// JSON configuration file
    #[clap(long, env = "AUTOTSS_CONFIG")]
    config: Option<PathBuf>,
    /// Log filter, such as `info` or `autotss=debug`
    #[clap(long, default_value = "warn")]
    loglevel: String,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a device, asking for any field not given
    Add {
        #[clap(long)]
        user: UserId,
        #[clap(long)]
        name: Option<String>,
        #[clap(long)]
        identifier: Option<String>,
        #[clap(long)]
        boardconfig: Option<String>,
        #[clap(long)]
        ecid: Option<String>,
        #[clap(long)]
        generator: Option<String>,
        #[clap(long)]
        apnonce: Option<String>,
    },
    /// Remove a device
    Remove { ecid: String },
    /// List devices of one user, or of everyone
    List {
        #[clap(long)]
        user: Option<UserId>,
    },
    /// Save blobs now
    Save {
        #[clap(long, conflicts_with = "ecid")]
        user: Option<UserId>,
        #[clap(long)]
        ecid: Option<String>,
    },
    /// Include a user's devices in background saving
    Enable { user: UserId },
    /// Exclude a user's devices from background saving
    Disable { user: UserId },
}

/// Line prompts on stdin that give up after a fixed wait.
struct Prompter {
    lines: Lines<BufReader<Stdin>>,
    timeout: Duration,
    used: bool,
}

impl Prompter {
    fn new(timeout: Duration) -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
            timeout,
            used: false,
        }
    }

    async fn ask(&mut self, question: &str) -> anyhow::Result<String> {
        self.used = true;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{}: ", question).as_bytes()).await?;
        stdout.flush().await?;

        match time::timeout(self.timeout, self.lines.next_line()).await {
            Ok(Ok(Some(line))) => Ok(line.trim().to_string()),
            Ok(Ok(None)) => bail!("input closed, no device was added"),
            Ok(Err(err)) => Err(err).context("failed to read input"),
            Err(_) => bail!(
                "no answer within {}s, no device was added",
                self.timeout.as_secs()
            ),
        }
    }

    async fn required(&mut self, value: Option<String>, question: &str) -> anyhow::Result<String> {
        match value {
            Some(value) => Ok(value),
            None => self.ask(question).await,
        }
    }

    /// Only asked in an interactive session; an empty answer means none.
    async fn optional(&mut self, value: Option<String>, question: &str) -> anyhow::Result<Option<String>> {
        if value.is_some() || !self.used {
            return Ok(value);
        }
        let answer = self.ask(question).await?;
        Ok(if answer.is_empty() { None } else { Some(answer) })
    }
}

fn parse_ecid(input: &str) -> anyhow::Result<Ecid> {
    Ecid::parse(input).ok_or_else(|| anyhow!("'{}' is not a valid ECID", input))
}

fn print_device(device: &Device, owner: Option<UserId>) {
    println!("{} ({})", device.name, device.ecid);
    if let Some(owner) = owner {
        println!("  owner: {}", owner);
    }
    println!("  identifier: {}", device.identifier);
    println!("  boardconfig: {}", device.boardconfig);
    println!("  cpid: {:#06x}", device.cpid);
    println!("  generator: {}", device.generator.as_deref().unwrap_or("none"));
    println!("  apnonce: {}", device.apnonce.as_deref().unwrap_or("none"));
    println!("  saved blobs: {}", device.saved_blobs.len());
}

async fn tool(opts: Opts) -> anyhow::Result<()> {
    let config = Config::load(opts.config.as_deref())?;
    let services = Services::open(&config)?;
    let store = &services.store;

    match opts.command {
        Command::Add {
            user,
            name,
            identifier,
            boardconfig,
            ecid,
            generator,
            apnonce,
        } => {
            let mut prompter = Prompter::new(config.prompt_timeout());
            let name = prompter.required(name, "Device name").await?;
            let identifier = prompter.required(identifier, "Identifier (e.g. iPhone10,6)").await?;
            let boardconfig = prompter.required(boardconfig, "Board config (e.g. d221ap)").await?;
            let ecid = prompter.required(ecid, "ECID").await?;
            let generator = prompter.optional(generator, "Generator (empty for none)").await?;
            let apnonce = prompter.optional(apnonce, "ApNonce (empty for none)").await?;

            let device = DeviceBuilder::new(&name, &identifier, &boardconfig, &ecid)
                .generator(generator.as_deref())
                .apnonce(apnonce.as_deref())
                .build(services.catalog.as_ref())
                .await?;
            store.add(user, &device)?;
            println!("Added {} ({}) for user {}", device.name, device.ecid, user);
        }
        Command::Remove { ecid } => {
            let ecid = parse_ecid(&ecid)?;
            let owner = store.owner(&ecid)?;
            let device = store.remove(&ecid)?;
            match owner {
                Some(owner) => println!("Removed {} ({}) from user {}", device.name, device.ecid, owner),
                None => println!("Removed {} ({})", device.name, device.ecid),
            }
        }
        Command::List { user: Some(user) } => {
            let enabled = store
                .enabled(user)?
                .ok_or(registry::Error::UnknownUser(user))?;
            println!(
                "User {}: background saving {}",
                user,
                if enabled { "enabled" } else { "disabled" }
            );
            for device in store.devices(Scope::User(user))? {
                print_device(&device, None);
            }
        }
        Command::List { user: None } => {
            for device in store.devices(Scope::All)? {
                let owner = store.owner(&device.ecid)?;
                print_device(&device, owner);
            }
        }
        Command::Save { user, ecid } => {
            let report = match (user, ecid) {
                (Some(user), _) => services.saver.save_user(user, Trigger::Manual).await?,
                (None, Some(ecid)) => {
                    services
                        .saver
                        .save_device(&parse_ecid(&ecid)?, Trigger::Manual)
                        .await?
                }
                (None, None) => services.saver.save_all(Trigger::Manual).await?,
            };
            println!("{}", report);
        }
        Command::Enable { user } => {
            store.set_enabled(user, true)?;
            println!("Enabled background saving for user {}", user);
        }
        Command::Disable { user } => {
            store.set_enabled(user, false)?;
            println!("Disabled background saving for user {}", user);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let opts = Opts::parse();
    env_logger::Builder::new().parse_filters(&opts.loglevel).init();

    if let Err(err) = tool(opts).await {
        eprintln!("autotss-cli: {:#}", err);
        process::exit(1);
    }
}
