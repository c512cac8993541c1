use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SchedulerMode {
    RoundRobin,
    Priority,
}

impl Default for SchedulerMode {
    fn default() -> Self {
        SchedulerMode::RoundRobin
    }
}

/// One rotation entry: a template (plus variant) the scheduler cycles through.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSlot {
    pub template_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ecosystem_variant: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    /// Minutes a run of this template holds its slot before yielding.
    /// Fractional values are honored (sub-minute slices).
    #[serde(default = "default_time_slice")]
    pub time_slice_minutes: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_run_time_minutes: f64,
}

fn default_true() -> bool {
    true
}

fn default_time_slice() -> f64 {
    60.0
}

impl TemplateSlot {
    pub fn new(template_name: impl Into<String>, ecosystem_variant: Option<String>) -> Self {
        Self {
            template_name: template_name.into(),
            ecosystem_variant,
            enabled: true,
            priority: 0,
            time_slice_minutes: default_time_slice(),
            current_run_id: None,
            last_run_at: None,
            total_run_time_minutes: 0.0,
        }
    }

    pub fn slice_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.time_slice_minutes * 60.0)
    }
}

/// Persisted auto-run scheduler state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoRunConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub entries: Vec<TemplateSlot>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub mode: SchedulerMode,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
    #[serde(default = "default_true")]
    pub pause_on_failure: bool,
    #[serde(default = "default_max_failures")]
    pub max_failures_before_pause: u32,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_max_failures() -> u32 {
    3
}

impl Default for AutoRunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            entries: Vec::new(),
            max_concurrent: default_max_concurrent(),
            mode: SchedulerMode::default(),
            consecutive_failures: 0,
            paused: false,
            pause_reason: None,
            pause_on_failure: true,
            max_failures_before_pause: default_max_failures(),
        }
    }
}

impl AutoRunConfig {
    pub fn entry(&self, template_name: &str, variant: Option<&str>) -> Option<&TemplateSlot> {
        self.entries.iter().find(|e| {
            e.template_name == template_name && e.ecosystem_variant.as_deref() == variant
        })
    }

    pub fn entry_mut(
        &mut self,
        template_name: &str,
        variant: Option<&str>,
    ) -> Option<&mut TemplateSlot> {
        self.entries.iter_mut().find(|e| {
            e.template_name == template_name && e.ecosystem_variant.as_deref() == variant
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let config: AutoRunConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.enabled);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.mode, SchedulerMode::RoundRobin);
        assert!(config.pause_on_failure);
        assert_eq!(config.max_failures_before_pause, 3);
    }

    #[test]
    fn fractional_slice_duration() {
        let mut slot = TemplateSlot::new("t", None);
        slot.time_slice_minutes = 0.5;
        assert_eq!(slot.slice_duration(), std::time::Duration::from_secs(30));
    }
}
