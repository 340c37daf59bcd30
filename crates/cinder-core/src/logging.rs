use std::sync::Once;

static INIT: Once = Once::new();

/// Installs the fmt subscriber once. `level` wins over `CINDER_LOG`; the
/// fallback filter is `warn`.
pub fn init_with_level(level: Option<&str>) {
    INIT.call_once(|| {
        if tracing::dispatcher::has_been_set() {
            return;
        }

        let env = match level {
            Some(l) if !l.is_empty() => l.to_string(),
            _ => std::env::var("CINDER_LOG").unwrap_or_else(|_| "warn".to_string()),
        };

        let filter = tracing_subscriber::EnvFilter::try_new(env.clone()).unwrap_or_else(|e| {
            eprintln!("WARN: invalid CINDER_LOG '{env}': {e}; falling back to 'warn'");
            tracing_subscriber::EnvFilter::new("warn")
        });

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .compact()
            .try_init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_with_level(Some("debug"));
        init_with_level(Some("not a valid filter [["));
        tracing::debug!("logging initialized");
    }
}
