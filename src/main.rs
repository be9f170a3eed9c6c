use game_coordinator::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::load();
    simple_logger::init_with_level(cli.log_level.as_level())?;
    game_coordinator::server_main(cli).await
}
