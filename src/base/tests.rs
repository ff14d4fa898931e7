use crate::base::neterror::NetError;
use std::io;

#[test]
fn test_net_error_roundtrip() {
    let original = NetError::ConnectionRefused;
    let code = original.as_i32();
    assert_eq!(code, -102);
    let converted = NetError::from(code);
    assert!(matches!(converted, NetError::ConnectionRefused));

    // Custom error
    let custom = NetError::PoolClosed;
    let custom_code = custom.as_i32();
    assert_eq!(custom_code, -10001);
    assert!(matches!(NetError::from(custom_code), NetError::PoolClosed));
}

#[test]
fn test_unknown_error() {
    let err = NetError::from(-9999);
    assert!(matches!(err, NetError::Unknown(-9999)));
}

#[test]
fn test_collision_avoidance() {
    // Crate codes must not land in Chromium's blob range (-900 to -906).
    let blob_range = -906..=-900;
    for err in [
        NetError::WaitQueueFull { max: 1 },
        NetError::PoolClosed,
        NetError::InvalidArgument("x"),
        NetError::CallbackPanicked {
            message: String::new(),
        },
    ] {
        assert!(!blob_range.contains(&err.as_i32()));
    }
}

#[test]
fn test_handshake_failure_keeps_cause() {
    let err = NetError::ssl_handshake(NetError::SslError {
        message: "certificate verify failed".into(),
    });
    assert_eq!(err.as_i32(), -148);
    assert!(err.to_string().contains("certificate verify failed"));

    let source = std::error::Error::source(&err).expect("cause attached");
    assert!(source.to_string().contains("certificate verify failed"));
}

#[test]
fn test_from_io_error() {
    let refused: NetError = io::Error::new(io::ErrorKind::ConnectionRefused, "no").into();
    assert!(matches!(refused, NetError::ConnectionRefused));
    assert!(refused.is_connect_failure());

    let eof: NetError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
    assert!(matches!(eof, NetError::ConnectionClosed));
    assert!(!eof.is_connect_failure());
}

#[test]
fn test_proxy_failure_keeps_cause() {
    let io = io::Error::new(io::ErrorKind::ConnectionReset, "reset by proxy");
    let err = NetError::proxy_handshake(NetError::handshake_io(NetError::ConnectionReset, io));
    assert_eq!(err.as_i32(), -130);
    assert!(matches!(err.root_cause(), NetError::ConnectionReset));
    assert!(err.to_string().contains("reset by proxy"));

    let inner = std::error::Error::source(&err).expect("cause attached");
    assert!(std::error::Error::source(inner).is_some(), "io error kept");
}
