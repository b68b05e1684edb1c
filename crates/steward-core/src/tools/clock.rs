use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use super::{schema_for, Tool};

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct CurrentTimeArgs {
    /// UTC offset in hours, e.g. -5 or 5.5. Defaults to UTC.
    #[serde(default)]
    utc_offset_hours: Option<f64>,
}

/// Reports the current date and time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in RFC 3339 format, optionally at a UTC offset."
    }

    fn parameters_schema(&self) -> Value {
        schema_for::<CurrentTimeArgs>()
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let args: CurrentTimeArgs = if params.is_null() {
            CurrentTimeArgs::default()
        } else {
            serde_json::from_value(params).context("invalid current_time arguments")?
        };
        let hours = args.utc_offset_hours.unwrap_or(0.0);
        if !(-14.0..=14.0).contains(&hours) {
            anyhow::bail!("utc_offset_hours must be between -14 and 14");
        }
        let offset = FixedOffset::east_opt((hours * 3600.0).round() as i32)
            .context("invalid UTC offset")?;
        Ok(Utc::now().with_timezone(&offset).to_rfc3339())
    }
}
