use super::*;

use once_cell::sync::Lazy;
use std::sync::Mutex;

// Static Mutex to serialize tests modifying environment variables.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn clear_env_vars() {
    env::remove_var("MAILCATCH_SMTP_URL");
    env::remove_var("MAILCATCH_REUSE_PORT");
    env::remove_var("MAILCATCH_TLS_CERT");
    env::remove_var("MAILCATCH_TLS_KEY");
}

#[test]
fn defaults_apply_when_nothing_is_set() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    let config = Config::from_env().unwrap();
    assert_eq!(config.smtp_urls, [DEFAULT_SMTP_URL]);
    assert!(!config.reuse_port);
    assert!(config.tls_cert.is_none());
    assert!(config.tls_key.is_none());
}

#[test]
fn url_list_is_comma_separated() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    env::set_var(
        "MAILCATCH_SMTP_URL",
        "smtp://127.0.0.1:1025, smtps://0.0.0.0:1465",
    );
    let config = Config::from_env().unwrap();
    assert_eq!(
        config.smtp_urls,
        ["smtp://127.0.0.1:1025", "smtps://0.0.0.0:1465"]
    );

    clear_env_vars();
}

#[test]
fn blank_url_list_is_rejected() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    env::set_var("MAILCATCH_SMTP_URL", " , ");
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("MAILCATCH_SMTP_URL"));

    clear_env_vars();
}

#[test]
fn reuse_port_parses_booleans() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    env::set_var("MAILCATCH_REUSE_PORT", "true");
    assert!(Config::from_env().unwrap().reuse_port);

    env::set_var("MAILCATCH_REUSE_PORT", "0");
    assert!(!Config::from_env().unwrap().reuse_port);

    env::set_var("MAILCATCH_REUSE_PORT", "maybe");
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("MAILCATCH_REUSE_PORT"));
    assert!(err.to_string().contains("maybe"));

    clear_env_vars();
}

#[test]
fn tls_cert_and_key_must_be_set_together() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    env::set_var("MAILCATCH_TLS_CERT", "/etc/mailcatch/cert.pem");
    let err = Config::from_env().unwrap_err();
    assert!(err.to_string().contains("MAILCATCH_TLS_KEY"));

    env::set_var("MAILCATCH_TLS_KEY", "/etc/mailcatch/key.pem");
    let config = Config::from_env().unwrap();
    assert_eq!(
        config.tls_cert.as_deref(),
        Some(std::path::Path::new("/etc/mailcatch/cert.pem"))
    );
    assert_eq!(
        config.tls_key.as_deref(),
        Some(std::path::Path::new("/etc/mailcatch/key.pem"))
    );

    clear_env_vars();
}

#[test]
fn endpoint_options_carry_listener_settings() {
    let _lock = ENV_LOCK.lock().unwrap();
    clear_env_vars();

    env::set_var("MAILCATCH_REUSE_PORT", "yes");
    env::set_var("MAILCATCH_TLS_CERT", "/tmp/cert.pem");
    env::set_var("MAILCATCH_TLS_KEY", "/tmp/key.pem");
    let options = Config::from_env().unwrap().endpoint_options();
    assert!(options.reuse_port);
    assert_eq!(options.tls_cert.as_deref(), Some(std::path::Path::new("/tmp/cert.pem")));
    assert_eq!(options.tls_key.as_deref(), Some(std::path::Path::new("/tmp/key.pem")));
    assert!(options.port.is_none());
    assert!(options.hostname.is_none());
    assert!(options.client_config.is_none());

    clear_env_vars();
}
