pub mod accounting;
pub mod bing;
pub mod driver;
pub mod mobile;
pub mod retry;
pub mod simulate;
pub mod snapshot;
pub mod surface;
pub mod trends;

pub use accounting::{DeviceMode, EarnablePoints};
pub use bing::{BingConfig, BingSearcher};
pub use driver::{DriverConfig, Outcome, QueryTerm, SearchDriver};
pub use mobile::{AppPointsClient, AppPointsConfig};
pub use simulate::{Simulator, SimulatorConfig};
pub use snapshot::{DashboardData, DashboardFetcher, FetcherConfig};
pub use surface::{ChromiumSurface, Surface, SurfaceConfig};
pub use trends::{TrendsClient, TrendsConfig};
