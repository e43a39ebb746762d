use crate::snapshot::{Counter, Counters, DashboardData};
use rand::Rng;

/// Which device persona the session runs under; it decides which counter
/// categories the accountant sums.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceMode {
    Desktop,
    Mobile,
}

impl DeviceMode {
    pub fn is_mobile(self) -> bool {
        matches!(self, DeviceMode::Mobile)
    }
}

fn selected<'a>(counters: &'a Counters, mode: DeviceMode) -> Vec<&'a Counter> {
    match mode {
        // Mobile sessions only ever earn against the first mobile counter.
        DeviceMode::Mobile => counters.mobile_search.first().into_iter().collect(),
        // Desktop sessions earn against the generic counter plus the
        // browser-variant counter.
        DeviceMode::Desktop => counters.pc_search.iter().take(2).collect(),
    }
}

/// Points still earnable in the selected categories.
pub fn missing_points(counters: &Counters, mode: DeviceMode) -> u32 {
    selected(counters, mode)
        .iter()
        .map(|c| c.point_progress_max.saturating_sub(c.point_progress))
        .sum()
}

/// Ceiling of the selected categories.
pub fn total_possible(counters: &Counters, mode: DeviceMode) -> u32 {
    selected(counters, mode)
        .iter()
        .map(|c| c.point_progress_max)
        .sum()
}

/// Points already earned in the selected categories.
pub fn current_points(counters: &Counters, mode: DeviceMode) -> u32 {
    selected(counters, mode)
        .iter()
        .map(|c| c.point_progress)
        .sum()
}

/// Earnable points left in the daily set bucket for `date_key`
/// (`MM/DD/YYYY`).
pub fn daily_set_points(data: &DashboardData, date_key: &str) -> u32 {
    data.daily_set_promotions
        .get(date_key)
        .map(|items| {
            items
                .iter()
                .map(|p| p.point_progress_max.saturating_sub(p.point_progress))
                .sum()
        })
        .unwrap_or(0)
}

/// Earnable points left across the supported, unlocked promotions.
pub fn more_promotions_points(data: &DashboardData) -> u32 {
    data.more_promotions
        .iter()
        .filter(|p| matches!(p.promotion_type.as_str(), "quiz" | "urlreward"))
        .filter(|p| p.exclusive_locked_feature_status != "locked")
        .map(|p| p.point_progress_max.saturating_sub(p.point_progress))
        .sum()
}

/// Today's daily-set bucket key.
pub fn todays_date_key() -> String {
    chrono::Local::now().format("%m/%d/%Y").to_string()
}

/// Per-category earnable points, summed over every entry the dashboard
/// reports (not just the session-relevant ones).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EarnablePoints {
    pub desktop_search: u32,
    pub mobile_search: u32,
    pub daily_set: u32,
    pub more_promotions: u32,
    pub total: u32,
}

pub fn browser_earnable(data: &DashboardData, date_key: &str) -> EarnablePoints {
    let delta =
        |c: &Counter| c.point_progress_max.saturating_sub(c.point_progress);
    let desktop_search = data.user_status.counters.pc_search.iter().map(delta).sum();
    let mobile_search = data
        .user_status
        .counters
        .mobile_search
        .iter()
        .map(delta)
        .sum();
    let daily_set = daily_set_points(data, date_key);
    let more_promotions = more_promotions_points(data);
    EarnablePoints {
        desktop_search,
        mobile_search,
        daily_set,
        more_promotions,
        total: desktop_search + mobile_search + daily_set + more_promotions,
    }
}

/// Randomized session cutoff. Small pools (`total <= 50`) are completed
/// exhaustively; larger ones stop somewhere in `[ceil(0.87 * total), total]`
/// so sessions do not always finish at exactly 100%.
pub fn search_target(total: u32, rng: &mut impl Rng) -> u32 {
    if total <= 50 {
        return total;
    }
    let fraction: f64 = rng.gen_range(0.87..=1.0);
    ((f64::from(total) * fraction).ceil() as u32).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Promotion;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn counters() -> Counters {
        Counters {
            pc_search: vec![Counter::new(40, 90), Counter::new(2, 12)],
            mobile_search: vec![Counter::new(30, 100)],
        }
    }

    #[test]
    fn accounting_identity_holds_per_mode() {
        let c = counters();
        for mode in [DeviceMode::Desktop, DeviceMode::Mobile] {
            assert_eq!(
                missing_points(&c, mode) + current_points(&c, mode),
                total_possible(&c, mode),
            );
        }
    }

    #[test]
    fn desktop_sums_generic_and_variant_only() {
        let mut c = counters();
        c.pc_search.push(Counter::new(0, 999)); // third entry is ignored
        assert_eq!(missing_points(&c, DeviceMode::Desktop), 50 + 10);
        assert_eq!(total_possible(&c, DeviceMode::Desktop), 102);
        assert_eq!(current_points(&c, DeviceMode::Desktop), 42);
    }

    #[test]
    fn mobile_uses_first_mobile_counter_only() {
        let c = counters();
        assert_eq!(missing_points(&c, DeviceMode::Mobile), 70);
        assert_eq!(total_possible(&c, DeviceMode::Mobile), 100);
    }

    #[test]
    fn absent_category_contributes_zero() {
        let c = Counters::default();
        assert_eq!(missing_points(&c, DeviceMode::Mobile), 0);
        assert_eq!(missing_points(&c, DeviceMode::Desktop), 0);
        assert_eq!(total_possible(&c, DeviceMode::Mobile), 0);
    }

    #[test]
    fn accountant_is_pure() {
        let c = counters();
        let first = (
            missing_points(&c, DeviceMode::Desktop),
            total_possible(&c, DeviceMode::Desktop),
            current_points(&c, DeviceMode::Desktop),
        );
        let second = (
            missing_points(&c, DeviceMode::Desktop),
            total_possible(&c, DeviceMode::Desktop),
            current_points(&c, DeviceMode::Desktop),
        );
        assert_eq!(first, second);
    }

    #[test]
    fn small_pool_target_is_exhaustive() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(search_target(40, &mut rng), 40);
        assert_eq!(search_target(50, &mut rng), 50);
        assert_eq!(search_target(0, &mut rng), 0);
    }

    #[test]
    fn large_pool_target_stays_in_band() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let target = search_target(60, &mut rng);
            assert!((53..=60).contains(&target), "target {target} out of band");
        }
        for _ in 0..1000 {
            let target = search_target(340, &mut rng);
            assert!((296..=340).contains(&target), "target {target} out of band");
        }
    }

    #[test]
    fn daily_set_sums_only_todays_bucket() {
        let mut daily = HashMap::new();
        daily.insert(
            "08/30/2026".to_string(),
            vec![
                Promotion {
                    point_progress: 0,
                    point_progress_max: 10,
                    ..Default::default()
                },
                Promotion {
                    point_progress: 5,
                    point_progress_max: 10,
                    ..Default::default()
                },
            ],
        );
        daily.insert(
            "08/29/2026".to_string(),
            vec![Promotion {
                point_progress: 0,
                point_progress_max: 50,
                ..Default::default()
            }],
        );
        let data = DashboardData {
            daily_set_promotions: daily,
            ..Default::default()
        };
        assert_eq!(daily_set_points(&data, "08/30/2026"), 15);
        assert_eq!(daily_set_points(&data, "01/01/2026"), 0);
    }

    #[test]
    fn promotions_filter_type_and_lock_status() {
        let promo = |ptype: &str, lock: &str, progress, max| Promotion {
            point_progress: progress,
            point_progress_max: max,
            promotion_type: ptype.to_string(),
            exclusive_locked_feature_status: lock.to_string(),
        };
        let data = DashboardData {
            more_promotions: vec![
                promo("quiz", "", 0, 10),
                promo("urlreward", "unlocked", 2, 10),
                promo("quiz", "locked", 0, 100),
                promo("welcometour", "", 0, 100),
            ],
            ..Default::default()
        };
        assert_eq!(more_promotions_points(&data), 18);
    }

    #[test]
    fn earnable_summary_adds_up() {
        let data = DashboardData {
            user_status: crate::snapshot::UserStatus {
                counters: counters(),
                available_points: 0,
            },
            ..Default::default()
        };
        let summary = browser_earnable(&data, "01/01/2026");
        assert_eq!(summary.desktop_search, 60);
        assert_eq!(summary.mobile_search, 70);
        assert_eq!(summary.total, 130);
    }
}
