use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 7;

/// Log line format: `[timestamp] [component] [level] {span fields} message key=value`
pub struct DerpLogFormatter {
    service_name: String,
    color_enabled: bool,
}

/// Log with a component tag, rendered as `derp-<component>`
#[macro_export]
macro_rules! component_info {
    ($component:expr, $($arg:tt)*) => {
        tracing::info!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_warn {
    ($component:expr, $($arg:tt)*) => {
        tracing::warn!(component = $component, $($arg)*)
    };
}

#[macro_export]
macro_rules! component_debug {
    ($component:expr, $($arg:tt)*) => {
        tracing::debug!(component = $component, $($arg)*)
    };
}

impl DerpLogFormatter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_color(service_name, color_supported())
    }

    pub fn with_color(service_name: impl Into<String>, color_enabled: bool) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled,
        }
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("derp-{}", comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_log_level(&self, level: &tracing::Level) -> String {
        let level_str = match *level {
            tracing::Level::ERROR => "✗ ERROR",
            tracing::Level::WARN => "⚠ WARN",
            tracing::Level::INFO => "ℹ INFO",
            tracing::Level::DEBUG => "◦ DEBUG",
            tracing::Level::TRACE => "◦ TRACE",
        };

        // icons are one char plus a space
        format!("{:<width$}", level_str, width = LOG_LEVEL_WIDTH + 2)
    }

    fn level_color(&self, level: &tracing::Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }

        match *level {
            tracing::Level::ERROR => COLOR_BRIGHT_RED,
            tracing::Level::WARN => COLOR_BRIGHT_YELLOW,
            tracing::Level::INFO => COLOR_GREEN,
            tracing::Level::DEBUG | tracing::Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for DerpLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.level_color(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            self.format_log_level(level),
            reset
        )?;

        // Span fields, outermost first: {relay=http://...}
        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{}}} ", fields)?;
                    }
                }
            }
        }

        write!(writer, "{}", visitor.message)?;
        for (name, value) in &visitor.fields {
            write!(writer, " {}={}", name, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{:?}", value),
            "component" => self.component = Some(trim_quotes(format!("{:?}", value))),
            name => self.fields.push((name, format!("{:?}", value))),
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }
}

fn trim_quotes(s: String) -> String {
    match s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => s,
    }
}

fn color_supported() -> bool {
    if std::env::var("TERM").unwrap_or_default() == "dumb" {
        return false;
    }
    std::io::stdout().is_terminal()
}
