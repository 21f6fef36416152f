//! Operations that start a run or fan items out

use crate::context::{expand_env, Context};
use crate::helpers::template::format_string;
use crate::operations::ensure_list;
use crate::pipeline::Operation;
use crate::{Data, Result, SumiError};
use async_trait::async_trait;
use chrono::{Months, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value;
use std::fmt::Write;
use std::time::Duration;

/// Merges the stage params into the item and passes it on
///
/// When a process-wide HTTP proxy is configured (and debug mode is off) the
/// run's session is switched to it.
pub struct Init;

#[async_trait]
impl Operation for Init {
    async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
        let settings = &ctx.services.settings;
        if let Some(proxy) = settings.http_proxy.as_ref().filter(|_| !settings.debug) {
            ctx.http.set_proxy(Some(proxy.clone()));
            ctx.http.save()?;
            tracing::info!("Configured HTTP proxy {}", proxy);
        }

        for (key, value) in ctx.params() {
            data.insert(key.clone(), expand_env(value));
        }
        ctx.emit(data)
    }
}

/// Emits one item per URL in the `url`/`urls` params
///
/// URLs may contain `{key}` or `%(key)s` placeholders filled from the
/// incoming item. The emitted items carry only the `url`.
pub struct Seed;

#[async_trait]
impl Operation for Seed {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        for key in ["url", "urls"] {
            for url in ensure_list(ctx.get(key)) {
                let Some(url) = url.as_str() else {
                    ctx.emit_warning(&format!("Ignoring non-string seed URL: {}", url));
                    continue;
                };
                let url = format_string(url, &data)?;
                let mut seed = Data::new();
                seed.insert("url".to_string(), Value::String(url));
                ctx.emit(seed)?;
            }
        }
        Ok(())
    }
}

/// Emits the item once per entry of the `items` param, as `data.item`
pub struct Enumerate;

#[async_trait]
impl Operation for Enumerate {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        for item in ensure_list(ctx.get("items")) {
            let mut next = data.clone();
            next.insert("item".to_string(), item);
            ctx.emit(next)?;
        }
        Ok(())
    }
}

/// Emits the item on every handler rule of the stage
pub struct Tee;

#[async_trait]
impl Operation for Tee {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        for rule in ctx.stage.handlers.keys() {
            ctx.emit_rule(rule, data.clone())?;
        }
        Ok(())
    }
}

/// Emits a range of numbers as `data.number`
///
/// Params: `start` (default 1), `stop` (exclusive), `step` (default 1, may
/// be negative), `delay` and `tag`.
///
/// With `delay` (seconds) only one number is emitted per invocation; the
/// stage then re-queues itself with the next number after the delay. With
/// `tag` every number is emitted at most once across runs.
pub struct Sequence;

#[async_trait]
impl Operation for Sequence {
    async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
        let mut number = data
            .get("number")
            .and_then(Value::as_i64)
            .or_else(|| ctx.get_i64("start"))
            .unwrap_or(1);
        let stop = ctx
            .get_i64("stop")
            .ok_or_else(|| SumiError::MetaData("sequence requires a `stop` param".to_string()))?;
        let step = ctx.get_i64("step").unwrap_or(1);
        if step == 0 {
            return Err(SumiError::MetaData("sequence `step` must not be 0".to_string()));
        }
        let delay = ctx.get_f64("delay").filter(|d| *d >= 0.0);
        let prefix = ctx.get_str("tag");

        loop {
            let tag = prefix.as_ref().map(|prefix| format!("{}:{}", prefix, number));
            let seen = match &tag {
                Some(tag) => ctx.check_tag(tag)?,
                None => false,
            };
            if !seen {
                let mut item = data.clone();
                item.insert("number".to_string(), Value::from(number));
                ctx.emit(item)?;
            }
            if let Some(tag) = &tag {
                ctx.set_tag(tag, &Value::Bool(true))?;
            }

            number += step;
            if (step > 0 && number >= stop) || (step < 0 && number <= stop) {
                break;
            }
            if let Some(delay) = delay {
                data.insert("number".to_string(), Value::from(number));
                return ctx.recurse(data, Some(Duration::from_secs_f64(delay)));
            }
        }
        Ok(())
    }
}

/// Emits a range of dates as `data.date` (formatted) and `data.date_iso`
///
/// Params: `format` (strftime, default `%Y-%m-%d`), `begin` and `end`
/// (parsed with `format`, default now) and the interval as any of `days`,
/// `weeks`, `months`, `years`. When `begin` is after `end` the range runs
/// backwards.
pub struct Dates;

#[async_trait]
impl Operation for Dates {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()> {
        let format = ctx.get_str("format").unwrap_or_else(|| "%Y-%m-%d".to_string());
        let days = ctx.get_i64("days").unwrap_or(0) + 7 * ctx.get_i64("weeks").unwrap_or(0);
        let months = ctx.get_i64("months").unwrap_or(0) + 12 * ctx.get_i64("years").unwrap_or(0);
        if days <= 0 && months <= 0 {
            tracing::error!("No interval given for dates");
            return Ok(());
        }
        let days = chrono::Duration::days(days.max(0));
        let months = Months::new(u32::try_from(months.max(0)).unwrap_or(u32::MAX));

        let now = Utc::now().naive_utc();
        let begin = match ctx.get_str("begin") {
            Some(value) => parse_date(&value, &format)?,
            None => now,
        };
        let end = match ctx.get_str("end") {
            Some(value) => parse_date(&value, &format)?,
            None => now,
        };

        let backwards = begin >= end;
        let mut current = Some(begin);
        while let Some(date) = current {
            if (backwards && date < end) || (!backwards && date > end) {
                break;
            }
            let mut item = data.clone();
            item.insert("date".to_string(), Value::String(format_date(&date, &format)?));
            item.insert(
                "date_iso".to_string(),
                Value::String(date.format("%Y-%m-%dT%H:%M:%S").to_string()),
            );
            ctx.emit(item)?;

            current = if backwards {
                date.checked_sub_months(months).and_then(|d| d.checked_sub_signed(days))
            } else {
                date.checked_add_months(months).and_then(|d| d.checked_add_signed(days))
            };
        }
        Ok(())
    }
}

fn parse_date(value: &str, format: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, format)
        .or_else(|_| {
            NaiveDate::parse_from_str(value, format).map(|d| d.and_time(NaiveTime::default()))
        })
        .map_err(|e| SumiError::MetaData(format!("Invalid date {:?} for {:?}: {}", value, format, e)))
}

fn format_date(date: &NaiveDateTime, format: &str) -> Result<String> {
    let mut out = String::new();
    write!(out, "{}", date.format(format))
        .map_err(|_| SumiError::MetaData(format!("Invalid date format {:?}", format)))?;
    Ok(out)
}
