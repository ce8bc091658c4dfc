// ABOUTME: Tests for Docker provider graceful degradation when Docker is unavailable
// ABOUTME: Verifies construction and availability probes report errors instead of panicking

use sandflow_sandbox::{DockerProvider, Provider, ProviderError};

/// DockerProvider::new() either connects or returns an informative error
#[tokio::test]
async fn test_docker_provider_unavailable_error() {
    match DockerProvider::new() {
        Ok(_) => {
            println!("Note: Docker is available. This test verifies behavior when Docker is unavailable.");
        }
        Err(e) => {
            let error_msg = e.to_string();
            assert!(
                error_msg.contains("Connection") || error_msg.contains("Docker"),
                "Error message should be informative about Docker unavailability: {}",
                error_msg
            );
        }
    }
}

/// info() either describes the daemon or fails with a connection error
#[tokio::test]
async fn test_info_without_daemon_is_connection_error() {
    let Ok(provider) = DockerProvider::new() else {
        return;
    };

    match provider.info().await {
        Ok(info) => {
            assert_eq!(info.provider_type, "docker");
            assert!(info.capabilities.file_transfer);
        }
        Err(e) => assert!(matches!(e, ProviderError::ConnectionError(_))),
    }
}
