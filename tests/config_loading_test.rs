//! Tests for configuration files feeding the generated tunnel config

use std::sync::Arc;
use std::time::Duration;

use remote_console::config::ConfigManager;
use remote_console::{ConnectionManager, MappingRequest, ServerSettings};

#[test]
fn test_config_and_settings_files_drive_preview() {
    let dir = tempfile::TempDir::new().unwrap();
    let settings_path = dir.path().join("config.ini");
    std::fs::write(
        &settings_path,
        "[frp_server]\nfrps_addr = frp.example.net\nfrps_port = 7100\nfrps_token = abc123\n",
    )
    .unwrap();

    let config_path = dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        format!(
            r#"
[tunnel]
settings_file = "{}"
terminate_timeout = "3s"

[bridge]
port_base = 30000
read_timeout = "50ms"

[shutdown]
timeout = "4s"
"#,
            settings_path.display()
        ),
    )
    .unwrap();

    let config = ConfigManager::load_from_file(&config_path).unwrap();
    assert_eq!(config.tunnel.terminate_timeout, Duration::from_secs(3));
    assert_eq!(config.bridge.read_timeout, Duration::from_millis(50));
    assert_eq!(config.bridge.write_timeout, Duration::from_secs(1));
    assert_eq!(config.shutdown.timeout, Duration::from_secs(4));
    assert_eq!(config.shutdown.poll_interval, Duration::from_millis(200));

    let server = ServerSettings::load(&config.tunnel.settings_file);
    assert_eq!(server.public_address(3000), "frp.example.net:3000");

    let manager = ConnectionManager::new(Arc::new(config), server);
    let text = manager
        .preview(&MappingRequest::parse_serial("/dev/ttyUSB0:9600:3000").unwrap())
        .unwrap();

    assert_eq!(
        text,
        "[common]\n\
         server_addr = frp.example.net\n\
         server_port = 7100\n\
         authentication_method = token\n\
         token = abc123\n\
         \n\
         [proxy_3000]\n\
         type = tcp\n\
         local_ip = 127.0.0.1\n\
         local_port = 30000\n\
         remote_port = 3000\n"
    );
}

#[test]
fn test_invalid_config_file_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[bridge]\nread_timeout = \"5s\"\n").unwrap();

    assert!(ConfigManager::load_from_file(&config_path).is_err());
}

#[test]
fn test_unreadable_settings_fall_back_to_defaults() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.ini");
    std::fs::write(&path, "[frp_server]\nfrps_port = not-a-port\n").unwrap();

    let server = ServerSettings::load(&path);
    assert_eq!(server, ServerSettings::default());
    assert!(server.is_placeholder());
    assert_eq!(server.public_address(22), "www.esun21.com:22");
}
