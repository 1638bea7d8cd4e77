use weeklybeat::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    weeklybeat::run(config).await
}
