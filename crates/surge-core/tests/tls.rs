//! TLS 引擎的端到端测试：双向认证、往返字节与半关闭。

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use surge_core::error::{TaskError, TlsError};
use surge_core::io::{AsyncRead, AsyncWrite, Closeable, duplex};
use surge_core::net::tls::{self, CertKeyPair, Certificate, ClientConfig, PrivateKey, ServerConfig};
use surge_core::run;
use surge_core::task::{all2, spawn};

struct TestPki {
    ca: Certificate,
    server: CertKeyPair,
    client: CertKeyPair,
}

/// 造一条最小证书链：自签 CA，各给服务端与客户端签一张叶子。
fn build_pki() -> TestPki {
    let ca_key = KeyPair::generate().expect("生成 CA 密钥");
    let mut ca_params =
        CertificateParams::new(Vec::<String>::new()).expect("构造 CA 参数");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).expect("自签 CA 证书");

    let server_key = KeyPair::generate().expect("生成服务端密钥");
    let server_cert = CertificateParams::new(vec!["localhost".to_string()])
        .expect("构造服务端参数")
        .signed_by(&server_key, &ca_cert, &ca_key)
        .expect("签发服务端证书");

    let client_key = KeyPair::generate().expect("生成客户端密钥");
    let client_cert = CertificateParams::new(vec!["client.local".to_string()])
        .expect("构造客户端参数")
        .signed_by(&client_key, &ca_cert, &ca_key)
        .expect("签发客户端证书");

    TestPki {
        ca: Certificate::from_der(ca_cert.der().as_ref().to_vec()),
        server: CertKeyPair {
            certs: vec![Certificate::from_der(server_cert.der().as_ref().to_vec())],
            key: PrivateKey::from_pkcs8_der(server_key.serialize_der()).expect("服务端私钥"),
        },
        client: CertKeyPair {
            certs: vec![Certificate::from_der(client_cert.der().as_ref().to_vec())],
            key: PrivateKey::from_pkcs8_der(client_key.serialize_der()).expect("客户端私钥"),
        },
    }
}

/// 按 `RUST_LOG` 输出握手失败的告警，方便排查证书问题。
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// 场景：双向认证握手后，11 字节在两个方向都原样往返；客户端随后
/// 半关闭，服务端读到流结束。
#[test]
fn mutual_auth_round_trip_and_half_close() {
    init_tracing();

    run(|| async {
        let pki = build_pki();

        let client_config = ClientConfig::new()
            .root_ca(pki.ca.clone())
            .identity(pki.client)
            .build()
            .expect("客户端配置应可构建");
        let server_config = ServerConfig::new(pki.server)
            .client_root_ca(pki.ca.clone())
            .build()
            .expect("服务端配置应可构建");

        let (client_stream, server_stream) = duplex(16384);

        let server = spawn(async move {
            let tls = tls::accept(server_stream, server_config).await?;

            let mut buf = [0u8; 11];
            let mut reader = tls.clone();
            reader
                .read_exactly(&mut buf)
                .await
                .map_err(TlsError::Io)?;
            assert_eq!(&buf, b"hello world", "服务端必须原样收到 11 字节");

            let mut writer = tls.clone();
            writer.write_all(b"HELLO WORLD").await.map_err(TlsError::Io)?;

            // 对端半关闭之后，读方向报告流结束。
            let mut tail = [0u8; 1];
            let n = tls.read(&mut tail).await?;
            assert_eq!(n, 0, "半关闭必须以 0 字节读取浮出");
            Ok::<_, TlsError>(())
        });

        let client = spawn(async move {
            let tls = tls::connect(client_stream, client_config, "localhost").await?;

            let mut writer = tls.clone();
            writer.write_all(b"hello world").await.map_err(TlsError::Io)?;

            let mut buf = [0u8; 11];
            let mut reader = tls.clone();
            reader
                .read_exactly(&mut buf)
                .await
                .map_err(TlsError::Io)?;
            assert_eq!(&buf, b"HELLO WORLD", "客户端必须原样收到 11 字节");

            tls.close().await?;
            Ok::<_, TlsError>(())
        });

        all2(client, server)
            .await
            .expect("双向认证的往返必须成功");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 不受信任的服务端：客户端握手以会话错误失败。
#[test]
fn untrusted_server_fails_the_handshake() {
    run(|| async {
        let pki = build_pki();

        // 客户端信任的是另一条证书链：服务端证书验证不过。
        let unrelated = build_pki();
        let client_config = ClientConfig::new()
            .root_ca(unrelated.ca)
            .build()
            .expect("客户端配置应可构建");
        let server_config = ServerConfig::new(pki.server)
            .build()
            .expect("服务端配置应可构建");

        let (client_stream, server_stream) = duplex(16384);

        let server = spawn(async move {
            tls::accept(server_stream, server_config).await.map(|_| ())
        });

        let outcome = tls::connect(client_stream, client_config, "localhost")
            .await
            .err();
        assert!(
            matches!(outcome, Some(TlsError::Session(_))),
            "证书验证失败必须映射为会话错误，实际 {outcome:?}"
        );

        // 客户端没有送出告警就放弃了握手；挂起的服务端直接取消。
        let _ = server.cancel();
        let _ = server.await;
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}

/// 底层流在握手中途终止：以「意外 EOF」而非普通 I/O 错误上报。
#[test]
fn truncated_stream_reports_unexpected_eof() {
    run(|| async {
        let pki = build_pki();

        let client_config = ClientConfig::new()
            .root_ca(pki.ca.clone())
            .build()
            .expect("客户端配置应可构建");

        let (client_stream, mut peer) = duplex(16384);

        // 对端读掉 ClientHello 后直接关闭连接。
        let closer = spawn(async move {
            let mut scratch = [0u8; 4096];
            let _ = peer.read(&mut scratch).await;
            peer.close().await.map_err(TlsError::Io)?;
            Ok::<_, TlsError>(())
        });

        let outcome = tls::connect(client_stream, client_config, "localhost")
            .await
            .err();
        assert!(
            matches!(outcome, Some(TlsError::UnexpectedEof)),
            "记录中途的流终止必须归类为意外 EOF，实际 {outcome:?}"
        );

        closer.await.expect("对端关闭动作应成功");
        Ok::<_, TaskError>(())
    })
    .expect("事件循环应正常退出")
    .expect("根任务应成功");
}
