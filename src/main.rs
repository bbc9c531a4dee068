use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "mailsink", version, about = "Gmail to Notion sync engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,

    /// Operate as this user (email); defaults to MAILSINK_USER
    #[arg(long, global = true)]
    user: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll recent mail and materialize matching messages
    Poll(PollArgs),
    /// Process a Pub/Sub push payload (base64 message data)
    Push(PushArgs),
    /// Run incremental catch-up from the stored history cursor
    Catchup(CatchupArgs),
    /// Manage Gmail push watches
    Watch {
        #[command(subcommand)]
        command: WatchCommands,
    },
    /// Dry-run custom extraction rules against a sample text
    Preview(PreviewArgs),
    /// Manage connected mail and Notion accounts
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
    /// Manage label-to-database mappings
    Mappings {
        #[command(subcommand)]
        command: MappingCommands,
    },
    /// Show database stats
    Stats,
}

#[derive(Debug, Args)]
struct PollArgs {
    /// Poll only this mapping id
    #[arg(long)]
    mapping: Option<String>,
    /// Poll only this mail account id
    #[arg(long)]
    account: Option<String>,
    /// Lookback window in days (1-365)
    #[arg(long)]
    days: Option<i64>,
    /// Full Gmail query override (replaces the window query)
    #[arg(long)]
    query: Option<String>,
}

#[derive(Debug, Args)]
struct PushArgs {
    /// Base64 message data; reads stdin when omitted
    data: Option<String>,
}

#[derive(Debug, Args)]
struct CatchupArgs {
    /// Catch up only this mail account id
    #[arg(long)]
    account: Option<String>,
}

#[derive(Debug, Subcommand)]
enum WatchCommands {
    /// Register a push watch (topic from MAILSINK_PUBSUB_TOPIC)
    Start {
        #[arg(long)]
        account: Option<String>,
    },
    /// Stop the push watch
    Stop {
        #[arg(long)]
        account: Option<String>,
    },
    /// Show cursor and watch state
    Status,
}

#[derive(Debug, Args)]
struct PreviewArgs {
    /// Path to a JSON rules file
    #[arg(long)]
    rules: String,
    /// Path to the sample text; reads stdin when omitted
    #[arg(long)]
    sample: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AccountCommands {
    /// Connect a Gmail account with existing OAuth tokens
    AddGoogle {
        email: String,
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: Option<String>,
        #[arg(long)]
        scope: Option<String>,
    },
    /// Connect a Notion workspace with an integration token
    AddNotion {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// List connected accounts
    List,
    /// Remove a mail or Notion account by id
    Remove { account_id: String },
}

#[derive(Debug, Subcommand)]
enum MappingCommands {
    /// Create a mapping from Gmail labels to a Notion database
    Add {
        notion_database_id: String,
        /// Gmail label name; repeatable, omit to match all mail
        #[arg(long = "label")]
        labels: Vec<String>,
        /// Bind to one mail account id (default: any)
        #[arg(long)]
        account: Option<String>,
        /// Use this Notion account id (default: first connected)
        #[arg(long)]
        notion_account: Option<String>,
    },
    /// List mappings
    List,
    /// Remove a mapping
    Remove { mapping_id: String },
    /// Enable a mapping
    Enable { mapping_id: String },
    /// Disable a mapping
    Disable { mapping_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::io::Read;
    use std::rc::Rc;

    use anyhow::{anyhow, Context, Result};
    use uuid::Uuid;

    use mailsink::extract::rules::{apply_rules, Rule};
    use mailsink::gmail::{GmailClient, GoogleCredentials, MailboxApi};
    use mailsink::notion::{DestinationApi, NotionClient};
    use mailsink::store::models::{MailAccount, Mapping, NotionAccount, User};
    use mailsink::store::Database;
    use mailsink::sync::push::decode_push_payload;
    use mailsink::sync::{self, CatchUpOutcome, DestinationResolver, PollOptions, PollReport};

    use super::{
        AccountCommands, CatchupArgs, Cli, Commands, MappingCommands, PollArgs, PreviewArgs,
        PushArgs, WatchCommands,
    };

    pub async fn dispatch(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::Poll(args) => handle_poll(args, cli.user, cli.json).await,
            Commands::Push(args) => handle_push_command(args, cli.json).await,
            Commands::Catchup(args) => handle_catchup(args, cli.user, cli.json).await,
            Commands::Watch { command } => handle_watch(command, cli.user, cli.json).await,
            Commands::Preview(args) => handle_preview(args).await,
            Commands::Accounts { command } => handle_accounts(command, cli.user).await,
            Commands::Mappings { command } => handle_mappings(command, cli.user).await,
            Commands::Stats => handle_stats(cli.json).await,
        }
    }

    fn open_database() -> Result<Database> {
        let db_path = Database::default_db_path().context("resolve default database path")?;
        Database::open(&db_path)
            .with_context(|| format!("open database at {}", db_path.display()))
    }

    fn resolve_user(db: &Database, cli_user: Option<String>) -> Result<User> {
        let email = cli_user
            .or_else(|| std::env::var("MAILSINK_USER").ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("no user given; pass --user or set MAILSINK_USER"))?;
        Ok(db.upsert_user(&email)?)
    }

    fn resolve_mail_accounts(
        db: &Database,
        user: &User,
        account_id: Option<&str>,
    ) -> Result<Vec<MailAccount>> {
        if let Some(account_id) = account_id {
            let account = db
                .get_mail_account(account_id)?
                .ok_or_else(|| anyhow!("mail account not found: {account_id}"))?;
            return Ok(vec![account]);
        }

        let accounts = db.list_mail_accounts(&user.id)?;
        if accounts.is_empty() {
            return Err(anyhow!(
                "no mail accounts connected; use 'mailsink accounts add-google' first"
            ));
        }
        Ok(accounts)
    }

    fn resolve_single_mail_account(
        db: &Database,
        user: &User,
        account_id: Option<&str>,
    ) -> Result<MailAccount> {
        let mut accounts = resolve_mail_accounts(db, user, account_id)?;
        match accounts.len() {
            1 => Ok(accounts.remove(0)),
            _ => Err(anyhow!(
                "multiple mail accounts connected; pass --account <id> to disambiguate"
            )),
        }
    }

    /// Notion credentials for a mapping: its pinned workspace, else the
    /// user's first connected one, else MAILSINK_NOTION_TOKEN.
    fn destination_for_mapping(
        db: &Database,
        user: &User,
        mapping: &Mapping,
    ) -> Result<NotionClient> {
        let account = match &mapping.notion_account_id {
            Some(id) => db.get_notion_account(id)?,
            None => db.default_notion_account(&user.id)?,
        };
        let token = match account {
            Some(account) => account.access_token,
            None => mailsink::notion::token_from_env()
                .context("no notion workspace connected for mapping")?,
        };
        Ok(NotionClient::new(&token))
    }

    /// Per-mapping destination lookup for the history paths.
    struct MappingDestinations<'a> {
        db: &'a Database,
        user: &'a User,
    }

    impl DestinationResolver for MappingDestinations<'_> {
        fn resolve(&self, mapping: &Mapping) -> Result<Rc<dyn DestinationApi>> {
            let client = destination_for_mapping(self.db, self.user, mapping)?;
            Ok(Rc::new(client))
        }
    }

    fn print_poll_report(report: &PollReport, mapping_id: &str, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(report)?);
            return Ok(());
        }

        if report.ok {
            println!(
                "poll {mapping_id}: processed={}/{} q=\"{}\" errors={}",
                report.processed,
                report.total,
                report.q,
                report.errors.len()
            );
            for error in &report.errors {
                println!("- {} [{}]: {}", error.message_id, error.step, error.detail);
            }
        } else {
            println!(
                "poll {mapping_id} failed: {} ({})",
                report.message.as_deref().unwrap_or("unknown error"),
                report.error.unwrap_or("ERROR"),
            );
            if !report.suggestions.is_empty() {
                println!("did you mean: {}", report.suggestions.join(", "));
            }
        }
        Ok(())
    }

    fn print_catchup_outcome(account: &MailAccount, outcome: &CatchUpOutcome, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(outcome)?);
            return Ok(());
        }
        match outcome {
            CatchUpOutcome::Baseline { history_id } => {
                println!("catchup {}: baseline cursor {history_id} recorded", account.id);
            }
            CatchUpOutcome::Reset { history_id } => {
                println!("catchup {}: stale cursor reset to {history_id}", account.id);
            }
            CatchUpOutcome::Applied {
                added,
                materialized,
            } => {
                println!(
                    "catchup {}: added={added} materialized={materialized}",
                    account.id
                );
            }
        }
        Ok(())
    }

    async fn handle_poll(args: PollArgs, cli_user: Option<String>, json: bool) -> Result<()> {
        let db = open_database()?;
        let user = resolve_user(&db, cli_user)?;
        let credentials = GoogleCredentials::from_env()?;
        let options = PollOptions {
            days: args.days,
            query: args.query,
        };

        for account in resolve_mail_accounts(&db, &user, args.account.as_deref())? {
            let mailbox = GmailClient::connect(&db, &account, &credentials).await?;
            // One label listing per account, shared across its mappings.
            let labels = mailbox
                .list_labels()
                .await
                .with_context(|| format!("list labels for account {}", account.id))?;

            let mappings = match &args.mapping {
                Some(mapping_id) => {
                    let mapping = db
                        .get_mapping(mapping_id)?
                        .ok_or_else(|| anyhow!("mapping not found: {mapping_id}"))?;
                    vec![mapping]
                }
                None => db.enabled_mappings_for_account(&user.id, &account.id)?,
            };
            if mappings.is_empty() {
                println!("no enabled mappings for account {}", account.id);
                continue;
            }

            for mapping in &mappings {
                let destination = destination_for_mapping(&db, &user, mapping)?;
                let report = sync::poll_and_ingest(
                    &db,
                    &mailbox,
                    &destination,
                    &account,
                    mapping,
                    &labels,
                    &options,
                )
                .await;
                print_poll_report(&report, &mapping.id, json)?;
            }
        }
        Ok(())
    }

    async fn handle_push_command(args: PushArgs, json: bool) -> Result<()> {
        let data = match args.data {
            Some(data) => data,
            None => {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("read push payload from stdin")?;
                buffer
            }
        };

        let Some(notification) = decode_push_payload(data.trim()) else {
            println!("push payload malformed or incomplete, ignored");
            return Ok(());
        };

        let db = open_database()?;
        let Some(account) = db.find_mail_account_by_email(&notification.email_address)? else {
            println!("push for unknown account {}, ignored", notification.email_address);
            return Ok(());
        };
        let user = db
            .find_user_by_id(&account.user_id)?
            .ok_or_else(|| anyhow!("owning user missing for account {}", account.id))?;

        let credentials = GoogleCredentials::from_env()?;
        let mailbox = GmailClient::connect(&db, &account, &credentials).await?;
        let destinations = MappingDestinations { db: &db, user: &user };
        let topic = push_topic_from_env();

        let outcome = sync::process_history_for_account(
            &db,
            &mailbox,
            &destinations,
            &account,
            topic.as_deref(),
            Some(&notification.history_id),
        )
        .await?;
        print_catchup_outcome(&account, &outcome, json)
    }

    async fn handle_catchup(args: CatchupArgs, cli_user: Option<String>, json: bool) -> Result<()> {
        let db = open_database()?;
        let user = resolve_user(&db, cli_user)?;
        let credentials = GoogleCredentials::from_env()?;
        let destinations = MappingDestinations { db: &db, user: &user };
        let topic = push_topic_from_env();

        for account in resolve_mail_accounts(&db, &user, args.account.as_deref())? {
            let mailbox = GmailClient::connect(&db, &account, &credentials).await?;
            let outcome = sync::process_history_for_account(
                &db,
                &mailbox,
                &destinations,
                &account,
                topic.as_deref(),
                None,
            )
            .await?;
            print_catchup_outcome(&account, &outcome, json)?;
        }
        Ok(())
    }

    async fn handle_watch(
        command: WatchCommands,
        cli_user: Option<String>,
        json: bool,
    ) -> Result<()> {
        let db = open_database()?;
        let user = resolve_user(&db, cli_user)?;
        let credentials = GoogleCredentials::from_env()?;

        match command {
            WatchCommands::Start { account } => {
                let topic = push_topic_from_env()
                    .ok_or_else(|| anyhow!("no push topic; set MAILSINK_PUBSUB_TOPIC"))?;
                let account = resolve_single_mail_account(&db, &user, account.as_deref())?;
                let mailbox = GmailClient::connect(&db, &account, &credentials).await?;
                sync::start_watch(&db, &mailbox, &account, &topic).await?;
                println!("watch started for {}", account.id);
            }
            WatchCommands::Stop { account } => {
                let account = resolve_single_mail_account(&db, &user, account.as_deref())?;
                let mailbox = GmailClient::connect(&db, &account, &credentials).await?;
                sync::stop_watch(&db, &mailbox, &account).await?;
                println!("watch stopped for {}", account.id);
            }
            WatchCommands::Status => {
                for account in db.list_mail_accounts(&user.id)? {
                    let state = account.watch_state();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&state)?);
                    } else {
                        println!(
                            "{}  cursor={}  active={}  expires={}",
                            account.id,
                            state.history_id.as_deref().unwrap_or("(none)"),
                            state.watch_active,
                            state
                                .watch_expires_at
                                .map(|ms| ms.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_preview(args: PreviewArgs) -> Result<()> {
        let rules_raw = std::fs::read_to_string(&args.rules)
            .with_context(|| format!("read rules file {}", args.rules))?;
        let rules: Vec<Rule> =
            serde_json::from_str(&rules_raw).context("decode rules JSON")?;

        let sample = match args.sample {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("read sample file {path}"))?,
            None => {
                let mut buffer = String::new();
                std::io::stdin()
                    .read_to_string(&mut buffer)
                    .context("read sample from stdin")?;
                buffer
            }
        };

        let preview = apply_rules(&sample, &rules);
        println!("{}", serde_json::to_string_pretty(&preview)?);
        Ok(())
    }

    async fn handle_accounts(command: AccountCommands, cli_user: Option<String>) -> Result<()> {
        let db = open_database()?;
        let user = resolve_user(&db, cli_user)?;

        match command {
            AccountCommands::AddGoogle {
                email,
                access_token,
                refresh_token,
                scope,
            } => {
                let account = MailAccount {
                    id: Uuid::new_v4().to_string(),
                    user_id: user.id.clone(),
                    email_address: email.trim().to_ascii_lowercase(),
                    access_token,
                    refresh_token,
                    scope,
                    token_expires_at: None,
                    history_id: None,
                    watch_active: false,
                    watch_expires_at: None,
                };
                db.insert_mail_account(&account)?;
                println!("Added mail account: {} ({})", account.id, account.email_address);
            }
            AccountCommands::AddNotion {
                access_token,
                workspace,
            } => {
                let account = NotionAccount {
                    id: Uuid::new_v4().to_string(),
                    user_id: user.id.clone(),
                    workspace_name: workspace,
                    access_token,
                };
                db.insert_notion_account(&account)?;
                println!("Added notion account: {}", account.id);
            }
            AccountCommands::List => {
                let mail = db.list_mail_accounts(&user.id)?;
                let notion = db.list_notion_accounts(&user.id)?;
                if mail.is_empty() && notion.is_empty() {
                    println!("No accounts connected.");
                    return Ok(());
                }
                println!("Mail accounts");
                println!("=============");
                for account in mail {
                    println!(
                        "{}  {}  watch={}",
                        account.id, account.email_address, account.watch_active
                    );
                }
                println!("Notion accounts");
                println!("===============");
                for account in notion {
                    println!(
                        "{}  {}",
                        account.id,
                        account.workspace_name.as_deref().unwrap_or("(unnamed)")
                    );
                }
            }
            AccountCommands::Remove { account_id } => {
                let removed =
                    db.remove_mail_account(&account_id)? + db.remove_notion_account(&account_id)?;
                if removed == 0 {
                    println!("No account found: {account_id}");
                } else {
                    println!("Removed account: {account_id}");
                }
            }
        }
        Ok(())
    }

    async fn handle_mappings(command: MappingCommands, cli_user: Option<String>) -> Result<()> {
        let db = open_database()?;
        let user = resolve_user(&db, cli_user)?;

        match command {
            MappingCommands::Add {
                notion_database_id,
                labels,
                account,
                notion_account,
            } => {
                // Label names resolve against the bound (or only) mailbox.
                let mail_account =
                    resolve_single_mail_account(&db, &user, account.as_deref())?;
                let credentials = GoogleCredentials::from_env()?;
                let mailbox = GmailClient::connect(&db, &mail_account, &credentials).await?;

                let mapping = sync::build_mapping(
                    &mailbox as &dyn MailboxApi,
                    &user.id,
                    account.as_deref(),
                    notion_account.as_deref(),
                    &notion_database_id,
                    &labels,
                )
                .await?;
                db.insert_mapping(&mapping)?;
                println!("Added mapping: {}", mapping.id);
            }
            MappingCommands::List => {
                let mappings = db.list_mappings(&user.id)?;
                if mappings.is_empty() {
                    println!("No mappings configured.");
                } else {
                    for mapping in mappings {
                        println!(
                            "{}  db={}  labels={}  enabled={}",
                            mapping.id,
                            mapping.notion_database_id,
                            if mapping.labels.is_empty() {
                                "(all mail)".to_string()
                            } else {
                                mapping.labels.join(",")
                            },
                            mapping.enabled,
                        );
                    }
                }
            }
            MappingCommands::Remove { mapping_id } => {
                let removed = db.remove_mapping(&mapping_id)?;
                if removed == 0 {
                    println!("No mapping found: {mapping_id}");
                } else {
                    println!("Removed mapping: {mapping_id}");
                }
            }
            MappingCommands::Enable { mapping_id } => {
                db.set_mapping_enabled(&mapping_id, true)?;
                println!("Enabled mapping: {mapping_id}");
            }
            MappingCommands::Disable { mapping_id } => {
                db.set_mapping_enabled(&mapping_id, false)?;
                println!("Disabled mapping: {mapping_id}");
            }
        }
        Ok(())
    }

    async fn handle_stats(json: bool) -> Result<()> {
        let db = open_database()?;
        let stats = db.get_stats()?;
        if json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else {
            println!("Users: {}", stats.total_users);
            println!("Mail accounts: {}", stats.total_mail_accounts);
            println!("Notion accounts: {}", stats.total_notion_accounts);
            println!("Mappings: {}", stats.total_mappings);
            println!("Links: {}", stats.total_links);
        }
        Ok(())
    }

    fn push_topic_from_env() -> Option<String> {
        std::env::var("MAILSINK_PUBSUB_TOPIC")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}
