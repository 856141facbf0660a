use once_cell::sync::Lazy;
use regex::Regex;
use sentry::{ClientInitGuard, ClientOptions};
use std::env;
use std::sync::Arc;

// Pre-compiled patterns for scrubbing event text
static EMAIL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Z|a-z]{2,}\b")
        .expect("Invalid email regex pattern")
});
static UNIX_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:~|/)(?:[^/\s"']+/)+[^/\s"']*"#).expect("Invalid unix path regex pattern")
});
static WINDOWS_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[A-Za-z]:\\(?:[^\\\s"']+\\)*[^\\\s"']*"#).expect("Invalid windows path regex pattern")
});
static MARKUP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<[A-Za-z][^>]*>[^<]*</[A-Za-z]+>").expect("Invalid markup regex pattern")
});

/// Initialize Sentry crash reporting
///
/// # Environment Variables
/// - `SENTRY_DSN`: Sentry Data Source Name (required)
/// - `SENTRY_ENVIRONMENT`: Environment name (default: "development")
/// - `SENTRY_RELEASE`: Release version (default: from Cargo.toml)
/// - `SENTRY_TRACES_SAMPLE_RATE`: Performance monitoring sample rate (default: 0.1)
///
/// Returns `None` when no DSN is configured. The guard must be kept alive
/// for the lifetime of the application.
pub fn init() -> Option<ClientInitGuard> {
    let dsn = match env::var("SENTRY_DSN").ok() {
        Some(d) if !d.is_empty() => d,
        _ => {
            log::info!("Sentry DSN not configured - crash reporting disabled");
            return None;
        }
    };

    let environment = env::var("SENTRY_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());
    let release = env::var("SENTRY_RELEASE").unwrap_or_else(|_| {
        format!("{}@{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    });
    let traces_sample_rate = env::var("SENTRY_TRACES_SAMPLE_RATE")
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .unwrap_or(0.1);

    let guard = sentry::init((
        dsn,
        ClientOptions {
            release: Some(release.into()),
            environment: Some(environment.into()),
            traces_sample_rate,
            attach_stacktrace: true,
            send_default_pii: false,
            before_send: Some(Arc::new(before_send_filter)),
            ..Default::default()
        },
    ));

    log::info!(
        "Sentry crash reporting initialized (environment: {})",
        guard.options().environment.as_deref().unwrap_or("unknown")
    );

    Some(guard)
}

/// Scrub events before they leave the machine.
///
/// Printed documents contain transcribed speech, so document markup, file
/// paths (export targets, spool files) and e-mail addresses never reach
/// the crash reporter.
fn before_send_filter(mut event: sentry::protocol::Event<'static>) -> Option<sentry::protocol::Event<'static>> {
    if let Some(message) = event.message.as_mut() {
        *message = scrub_message(message);
    }

    for exception in &mut event.exception.values {
        if let Some(value) = exception.value.as_mut() {
            *value = scrub_message(value);
        }
    }

    for breadcrumb in &mut event.breadcrumbs.values {
        if let Some(message) = breadcrumb.message.as_mut() {
            *message = scrub_message(message);
        }
    }

    event.tags.insert("service_version".into(), env!("CARGO_PKG_VERSION").into());
    event.tags.insert("platform".into(), std::env::consts::OS.into());
    event.tags.insert("arch".into(), std::env::consts::ARCH.into());

    Some(event)
}

fn scrub_message(message: &str) -> String {
    let mut cleaned = message.to_string();

    // Markup first, it may contain addresses and paths of its own
    cleaned = MARKUP_REGEX.replace_all(&cleaned, "[DOCUMENT_REDACTED]").to_string();
    cleaned = EMAIL_REGEX.replace_all(&cleaned, "[EMAIL_REDACTED]").to_string();
    cleaned = WINDOWS_PATH_REGEX.replace_all(&cleaned, "[PATH_REDACTED]").to_string();
    cleaned = UNIX_PATH_REGEX.replace_all(&cleaned, "[PATH_REDACTED]").to_string();

    cleaned
}

/// Capture a permanently failed print job.
///
/// The job id is hashed before sending.
pub fn capture_print_job_failure(job_id: &str, error: &str) {
    sentry::with_scope(
        |scope| {
            scope.set_tag("event_type", "print_job_failure");
            scope.set_context(
                "print_job",
                sentry::protocol::Context::Other(sentry::protocol::Map::from_iter(vec![(
                    "job_id_hash".to_string(),
                    format!("{:x}", md5::compute(job_id)).into(),
                )])),
            );
        },
        || {
            sentry::capture_message(
                &format!("Print job failed: {}", scrub_message(error)),
                sentry::Level::Error,
            );
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_email() {
        let cleaned = scrub_message("Export for jane.doe@example.com failed");
        assert!(!cleaned.contains("jane.doe@example.com"));
        assert!(cleaned.contains("[EMAIL_REDACTED]"));
    }

    #[test]
    fn test_scrub_unix_path() {
        let cleaned = scrub_message("Failed to write /home/ops/Documents/minutes.html: denied");
        assert!(!cleaned.contains("minutes.html"));
        assert!(cleaned.contains("[PATH_REDACTED]"));
    }

    #[test]
    fn test_scrub_windows_path() {
        let cleaned = scrub_message(r"Failed to write C:\Users\ops\minutes.html");
        assert!(!cleaned.contains("minutes.html"));
        assert!(cleaned.contains("[PATH_REDACTED]"));
    }

    #[test]
    fn test_scrub_document_markup() {
        let cleaned = scrub_message("Render error near <p>the patient said hello</p>");
        assert!(!cleaned.contains("patient"));
        assert!(cleaned.contains("[DOCUMENT_REDACTED]"));
    }

    #[test]
    fn test_plain_error_untouched() {
        let message = "Print job B failed after 3 attempts";
        assert_eq!(scrub_message(message), message);
    }
}
