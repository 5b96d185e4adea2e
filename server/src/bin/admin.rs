use {
    anyhow::bail,
    clap::{Parser, Subcommand},
    realmvault_server::{
        Config,
        config::{BackendConfig, init_logging},
    },
    std::path::PathBuf,
    tracing::info,
};

#[derive(Debug, Parser)]
pub struct Cli {
    #[clap(long)]
    pub config: PathBuf,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Apply the PostgreSQL migrations.
    Migrate,
    /// List the realms a user belongs to, with their role.
    Realms {
        #[clap(long)]
        organization: String,
        #[clap(long)]
        user: String,
    },
}

#[tokio::main]
#[expect(clippy::print_stdout, reason = "command output")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::parse(&cli.config)?;
    init_logging(&config.log_filter)?;
    match cli.command {
        Command::Migrate => {
            let BackendConfig::Postgres { database_url } = &config.backend else {
                bail!("migrations only apply to the postgres backend");
            };
            info!("Running migrations...");
            realmvault_server::migrate(database_url).await?;
            info!("Done");
        }
        Command::Realms { organization, user } => {
            let server = realmvault_server::open(&config).await?;
            let mut realms: Vec<_> = server
                .realms
                .get_realms_for_user(&organization.into(), &user.into())
                .await?
                .into_iter()
                .collect();
            if realms.is_empty() {
                println!("No realms.");
            }
            realms.sort();
            for (realm_id, role) in realms {
                println!("{realm_id} {role}");
            }
        }
    }
    Ok(())
}
