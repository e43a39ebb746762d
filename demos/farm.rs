use anyhow::Result;
use farmhand::driver::SearchDriver;
use farmhand::snapshot::DashboardFetcher;
use farmhand::{
    accounting, BingConfig, BingSearcher, ChromiumSurface, DriverConfig, FetcherConfig,
    Simulator, SimulatorConfig, SurfaceConfig, TrendsClient, TrendsConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let surface = if let Ok(ws) = std::env::var("CHROME_WS_URL") {
        if !ws.trim().is_empty() {
            ChromiumSurface::connect(&ws).await?
        } else {
            ChromiumSurface::launch(SurfaceConfig { headless: false, ..Default::default() }).await?
        }
    } else {
        ChromiumSurface::launch(SurfaceConfig { headless: false, ..Default::default() }).await?
    };
    let surface = Arc::new(surface);

    let fetcher = DashboardFetcher::new(surface.clone(), FetcherConfig::default());
    let snapshot = fetcher.fetch().await?;
    let earnable = accounting::browser_earnable(&snapshot, &accounting::todays_date_key());
    println!("earnable today: {earnable:?}");

    let trends = TrendsClient::new(TrendsConfig::default())?;
    let geo = std::env::var("FARM_GEO").unwrap_or_else(|_| "US".into());
    let mut terms = trends.fetch_terms(&geo).await?;
    let mut rng = StdRng::from_entropy();
    TrendsClient::shuffle_terms(&mut terms, &mut rng);

    let searcher = BingSearcher::new(
        surface.clone(),
        Simulator::new(SimulatorConfig::default(), false),
        BingConfig::default(),
        StdRng::from_entropy(),
    );
    searcher.warm_up().await?;

    let mut driver = SearchDriver::new(
        fetcher,
        searcher,
        trends,
        DriverConfig::desktop(),
        StdRng::from_entropy(),
    );
    let outcome = driver.run(&terms).await?;
    println!("session outcome: {outcome:?}");

    Ok(())
}
