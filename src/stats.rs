//! Dashboard statistics over the metadata registry.
//!
//! Summarizes how much has been ingested (registered files today, this week,
//! overall) and how runs have gone over the last seven days. Used by
//! `lake stats`. Day boundaries are UTC.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::Serialize;

use crate::metadata::MetadataRegistry;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dashboard {
    pub total_files: u64,
    pub today_files: u64,
    pub week_files: u64,
    pub week_tasks_total: u64,
    pub week_tasks_success: u64,
    /// Percent, one decimal. 100.0 when no tasks ran.
    pub week_success_rate: f64,
    /// Mean run duration in seconds, two decimals.
    pub week_avg_time_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub file_count: u64,
    pub success_count: u64,
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&midnight)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub async fn dashboard(registry: &dyn MetadataRegistry, now: DateTime<Utc>) -> Result<Dashboard> {
    let today = start_of_day(now);
    let week_start = today - Duration::days(7);

    let total_files = registry.count_registered(None).await?;
    let today_files = registry.count_registered(Some(today.timestamp())).await?;
    let week_files = registry
        .count_registered(Some(week_start.timestamp()))
        .await?;

    let stats = registry.task_stats_since(week_start.timestamp()).await?;
    let week_tasks_total: u64 = stats.iter().map(|s| s.file_count).sum();
    let week_tasks_success: u64 = stats.iter().map(|s| s.success_count).sum();
    let week_avg_time_sec = if stats.is_empty() {
        0.0
    } else {
        stats.iter().map(|s| s.duration_seconds).sum::<f64>() / stats.len() as f64
    };
    let week_success_rate = if week_tasks_total == 0 {
        100.0
    } else {
        round_to(
            week_tasks_success as f64 / week_tasks_total as f64 * 100.0,
            1,
        )
    };

    Ok(Dashboard {
        total_files,
        today_files,
        week_files,
        week_tasks_total,
        week_tasks_success,
        week_success_rate,
        week_avg_time_sec: round_to(week_avg_time_sec, 2),
    })
}

/// Per-day task totals for the last `days` days, oldest first. Days with no
/// runs are omitted.
pub async fn task_trend(
    registry: &dyn MetadataRegistry,
    days: u32,
    now: DateTime<Utc>,
) -> Result<Vec<TrendPoint>> {
    let since = start_of_day(now) - Duration::days(i64::from(days));
    let stats = registry.task_stats_since(since.timestamp()).await?;

    let mut by_day: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
    for stat in stats {
        let Some(at) = Utc.timestamp_opt(stat.timestamp, 0).single() else {
            continue;
        };
        let entry = by_day.entry(at.date_naive()).or_default();
        entry.0 += stat.file_count;
        entry.1 += stat.success_count;
    }
    Ok(by_day
        .into_iter()
        .map(|(date, (file_count, success_count))| TrendPoint {
            date,
            file_count,
            success_count,
        })
        .collect())
}

pub fn print_dashboard(d: &Dashboard, trend: &[TrendPoint]) {
    println!("Lake Ingest Dashboard");
    println!("=====================");
    println!();
    println!("  Files:         {}", d.total_files);
    println!("  Today:         {}", d.today_files);
    println!("  Last 7 days:   {}", d.week_files);
    println!();
    println!(
        "  Tasks (7d):    {} files, {} indexed ({:.1}%)",
        d.week_tasks_total, d.week_tasks_success, d.week_success_rate
    );
    println!("  Avg run time:  {:.2}s", d.week_avg_time_sec);

    if !trend.is_empty() {
        println!();
        println!("  {:<12} {:>8} {:>8}", "DATE", "FILES", "OK");
        println!("  {}", "-".repeat(30));
        for point in trend {
            println!(
                "  {:<12} {:>8} {:>8}",
                point.date.format("%Y-%m-%d").to_string(),
                point.file_count,
                point.success_count
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use crate::metadata::MemoryRegistry;
    use crate::models::TaskStat;

    fn stat(file_count: u64, success_count: u64, secs: f64, timestamp: i64) -> TaskStat {
        TaskStat {
            task_type: "batch".to_string(),
            file_count,
            success_count,
            duration_seconds: secs,
            timestamp,
        }
    }

    #[tokio::test]
    async fn empty_registry_reports_full_success() {
        let registry = MemoryRegistry::new();
        let d = dashboard(&registry, Utc::now()).await.unwrap();
        assert_eq!(d.total_files, 0);
        assert_eq!(d.week_success_rate, 100.0);
        assert_eq!(d.week_avg_time_sec, 0.0);
    }

    #[tokio::test]
    async fn week_window_and_rate() {
        let registry = MemoryRegistry::new();
        let now = Utc::now();
        registry
            .register(&hash_bytes(b"a"), "a.txt", 1)
            .await
            .unwrap();
        registry
            .insert_task_stat(&stat(3, 2, 1.0, now.timestamp()))
            .await
            .unwrap();
        registry
            .insert_task_stat(&stat(3, 1, 2.0, now.timestamp() - 3600))
            .await
            .unwrap();
        registry
            .insert_task_stat(&stat(100, 0, 9.0, (now - Duration::days(30)).timestamp()))
            .await
            .unwrap();

        let d = dashboard(&registry, now).await.unwrap();
        assert_eq!(d.total_files, 1);
        assert_eq!(d.today_files, 1);
        assert_eq!(d.week_tasks_total, 6);
        assert_eq!(d.week_tasks_success, 3);
        assert_eq!(d.week_success_rate, 50.0);
        assert_eq!(d.week_avg_time_sec, 1.5);
    }

    #[tokio::test]
    async fn trend_groups_by_day() {
        let registry = MemoryRegistry::new();
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        let day = 86_400;
        let noon = now.timestamp();
        registry.insert_task_stat(&stat(2, 2, 1.0, noon - 2 * day)).await.unwrap();
        registry.insert_task_stat(&stat(1, 0, 1.0, noon - 2 * day + 60)).await.unwrap();
        registry.insert_task_stat(&stat(5, 4, 1.0, noon)).await.unwrap();

        let trend = task_trend(&registry, 7, now).await.unwrap();
        assert_eq!(trend.len(), 2);
        assert_eq!(trend[0].date, NaiveDate::from_ymd_opt(2024, 5, 8).unwrap());
        assert_eq!((trend[0].file_count, trend[0].success_count), (3, 2));
        assert_eq!(trend[1].file_count, 5);
    }
}
