//! Handshake engine.
//!
//! Drives both roles of the handshake over a raw byte stream and hands back
//! a record sealer/opener pair once the peer is authenticated. The same
//! engine runs renegotiations, minus the version exchange.

use std::future::Future;
use std::sync::Arc;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::channel::config::ChannelConfig;
use crate::channel::error::ChannelError;
use crate::channel::protocol::{
    derive_master_key, initiator_signed_data, receive_message, responder_signed_data,
    send_message, AlertCode, ClientHello, HandshakeMessage, KeyExchange, Role, ServerHello,
    NONCE_SIZE,
};
use crate::channel::record::{check_record_size, RecordOpener, RecordSealer};
use crate::channel::transport::MAX_FRAME_SIZE;
use crate::crypto::{
    unix_now, verify_signature, Certificate, CertificateError, CryptoSuite, EphemeralKeyExchange,
    Identity, NoRevocationCheck, RevocationCheck, TrustStore,
};

/// Everything one side needs to authenticate channels.
pub struct HandshakeContext {
    identity: Identity,
    trust: TrustStore,
    config: ChannelConfig,
    psk: Option<Zeroizing<Vec<u8>>>,
    revocation: Arc<dyn RevocationCheck>,
}

impl HandshakeContext {
    pub fn new(
        identity: Identity,
        trust: TrustStore,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        config.validate()?;
        Ok(Self {
            identity,
            trust,
            config,
            psk: None,
            revocation: Arc::new(NoRevocationCheck),
        })
    }

    /// Mix a pre-shared secret into every master key.
    pub fn with_psk(mut self, psk: impl Into<Vec<u8>>) -> Self {
        self.psk = Some(Zeroizing::new(psk.into()));
        self
    }

    /// Use `revocation` during authentication.
    pub fn with_revocation(mut self, revocation: Arc<dyn RevocationCheck>) -> Self {
        self.revocation = revocation;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn trust(&self) -> &TrustStore {
        &self.trust
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn revocation(&self) -> &Arc<dyn RevocationCheck> {
        &self.revocation
    }

    fn psk(&self) -> Option<&[u8]> {
        self.psk.as_ref().map(|p| p.as_slice())
    }
}

impl std::fmt::Debug for HandshakeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeContext")
            .field("email", &self.identity.certificate().email())
            .field("roots", &self.trust.roots().len())
            .field("psk", &self.psk.is_some())
            .finish_non_exhaustive()
    }
}

/// Result of a successful handshake.
pub struct HandshakeOutcome {
    pub version: u8,
    pub suite: CryptoSuite,
    pub remote_certificate: Certificate,
    pub sealer: RecordSealer,
    pub opener: RecordOpener,
}

/// Run a full handshake, version negotiation included.
pub async fn perform_handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    role: Role,
    ctx: &HandshakeContext,
) -> Result<HandshakeOutcome, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let agreed = match role {
        Role::Initiator => offer_version(reader, writer, ctx).await?,
        Role::Responder => select_version(reader, writer, ctx).await?,
    };
    debug!(%role, version = agreed.version, "protocol version agreed");
    run_key_exchange(reader, writer, role, agreed, ctx, None).await
}

/// Run handshake steps 2-6 again on an established stream.
///
/// The peer must present exactly the certificate it presented before.
pub async fn perform_renegotiation<R, W>(
    reader: &mut R,
    writer: &mut W,
    role: Role,
    version: u8,
    ctx: &HandshakeContext,
    previous: &Certificate,
) -> Result<HandshakeOutcome, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let agreed = VersionAgreement {
        offered: version,
        version,
    };
    run_key_exchange(reader, writer, role, agreed, ctx, Some(previous)).await
}

/// Outcome of step 1, repeated in the signed hellos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VersionAgreement {
    offered: u8,
    version: u8,
}

async fn offer_version<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &HandshakeContext,
) -> Result<VersionAgreement, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let offered = ctx.config.max_version;
    send_message(writer, &HandshakeMessage::VersionOffer { version: offered }).await?;

    match step(ctx, "version select", receive_message(reader)).await? {
        HandshakeMessage::VersionSelect { version }
            if version <= offered && ctx.config.supports_version(version) =>
        {
            Ok(VersionAgreement { offered, version })
        }
        HandshakeMessage::VersionSelect { .. } => {
            Err(ChannelError::UnsupportedVersion { offered })
        }
        HandshakeMessage::Alert { code } => Err(code.into_error(offered)),
        other => Err(other.unexpected("VersionSelect")),
    }
}

async fn select_version<R, W>(
    reader: &mut R,
    writer: &mut W,
    ctx: &HandshakeContext,
) -> Result<VersionAgreement, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let offered = match step(ctx, "version offer", receive_message(reader)).await? {
        HandshakeMessage::VersionOffer { version } => version,
        other => {
            send_alert(writer, AlertCode::UnexpectedMessage).await;
            return Err(other.unexpected("VersionOffer"));
        }
    };

    match ctx.config.negotiate_version(offered) {
        Some(version) => {
            send_message(writer, &HandshakeMessage::VersionSelect { version }).await?;
            Ok(VersionAgreement { offered, version })
        }
        None => {
            send_alert(writer, AlertCode::ProtocolVersion).await;
            Err(ChannelError::UnsupportedVersion { offered })
        }
    }
}

/// Hellos, signed key exchange, master key, certificates, authentication.
async fn run_key_exchange<R, W>(
    reader: &mut R,
    writer: &mut W,
    role: Role,
    agreed: VersionAgreement,
    ctx: &HandshakeContext,
    previous: Option<&Certificate>,
) -> Result<HandshakeOutcome, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let version = agreed.version;
    let Hellos {
        suite,
        client_hello,
        server_hello,
        peer_record_size,
    } = match role {
        Role::Initiator => exchange_hellos_initiator(reader, writer, agreed, ctx).await?,
        Role::Responder => exchange_hellos_responder(reader, writer, agreed, ctx).await?,
    };
    debug!(%role, %suite, "cipher suite selected");

    let kx = EphemeralKeyExchange::generate(suite);
    let own_public = kx.public_key_bytes();

    // The responder's share goes first; the initiator's signature covers both.
    let peer_kx = match role {
        Role::Initiator => {
            let peer_kx = receive_key_exchange(reader, ctx).await?;
            let signed =
                initiator_signed_data(&client_hello, &server_hello, &peer_kx.public_key, &own_public);
            send_key_exchange(writer, own_public.clone(), ctx.identity.sign(&signed)).await?;
            peer_kx
        }
        Role::Responder => {
            let signed = responder_signed_data(&client_hello, &server_hello, &own_public);
            send_key_exchange(writer, own_public.clone(), ctx.identity.sign(&signed)).await?;
            receive_key_exchange(reader, ctx).await?
        }
    };

    let shared = kx.agree(&peer_kx.public_key)?;
    let master = derive_master_key(&shared, &client_hello, &server_hello, ctx.psk())?;
    drop(shared);

    let keys = master.session_keys(role);
    let mut sealer = RecordSealer::new(&keys.send, ctx.config.record_size)?;
    let mut opener = RecordOpener::new(&keys.receive, peer_record_size)?;
    drop(keys);
    drop(master);

    let peer_signed = match role {
        Role::Initiator => responder_signed_data(&client_hello, &server_hello, &peer_kx.public_key),
        Role::Responder => {
            initiator_signed_data(&client_hello, &server_hello, &own_public, &peer_kx.public_key)
        }
    };

    // Certificates travel encrypted. The responder reveals its identity only
    // to an initiator that passed every check.
    let own_certificate = HandshakeMessage::Certificate(ctx.identity.certificate().clone());
    let remote_certificate = match role {
        Role::Initiator => {
            send_certificate(&mut sealer, writer, &own_certificate).await?;
            let certificate = receive_certificate(&mut opener, reader, ctx).await?;
            authenticate(ctx, &certificate, previous, &peer_signed, &peer_kx.signature).await?;
            certificate
        }
        Role::Responder => {
            let certificate = receive_certificate(&mut opener, reader, ctx).await?;
            authenticate(ctx, &certificate, previous, &peer_signed, &peer_kx.signature).await?;
            send_certificate(&mut sealer, writer, &own_certificate).await?;
            certificate
        }
    };

    info!(
        %role,
        version,
        %suite,
        peer = %remote_certificate.email(),
        renegotiation = previous.is_some(),
        "handshake complete"
    );

    Ok(HandshakeOutcome {
        version,
        suite,
        remote_certificate,
        sealer,
        opener,
    })
}

/// Step 2 outcome. The encoded hellos feed the master key and signatures.
struct Hellos {
    suite: CryptoSuite,
    client_hello: Vec<u8>,
    server_hello: Vec<u8>,
    peer_record_size: usize,
}

fn peer_record_size(record_size: u16) -> Result<usize, ChannelError> {
    let record_size = usize::from(record_size);
    check_record_size(record_size)
        .map_err(|_| ChannelError::Malformed(format!("peer record size {}", record_size)))?;
    Ok(record_size)
}

/// Local record size as announced in a hello.
fn own_record_size(ctx: &HandshakeContext) -> u16 {
    // Validated against MAX_RECORD_SIZE, which fits the length field.
    ctx.config.record_size as u16
}

async fn exchange_hellos_initiator<R, W>(
    reader: &mut R,
    writer: &mut W,
    agreed: VersionAgreement,
    ctx: &HandshakeContext,
) -> Result<Hellos, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let client_hello = ClientHello::new(
        random_nonce(),
        agreed.offered,
        &ctx.config.suites,
        own_record_size(ctx),
    );
    send_message(writer, &HandshakeMessage::ClientHello(client_hello.clone())).await?;

    let server_hello = match step(ctx, "server hello", receive_message(reader)).await? {
        HandshakeMessage::ServerHello(hello) => hello,
        HandshakeMessage::Alert { code } => return Err(code.into_error(agreed.offered)),
        other => return Err(other.unexpected("ServerHello")),
    };
    if server_hello.version != agreed.version {
        return Err(ChannelError::VersionMismatch {
            agreed: agreed.version,
            hello: server_hello.version,
        });
    }

    let suite = CryptoSuite::try_from(server_hello.suite)?;
    if !ctx.config.suites.contains(&suite) {
        return Err(ChannelError::Malformed(format!(
            "responder selected {} which was not offered",
            suite
        )));
    }

    Ok(Hellos {
        suite,
        client_hello: client_hello.to_bytes()?,
        server_hello: server_hello.to_bytes()?,
        peer_record_size: peer_record_size(server_hello.record_size)?,
    })
}

async fn exchange_hellos_responder<R, W>(
    reader: &mut R,
    writer: &mut W,
    agreed: VersionAgreement,
    ctx: &HandshakeContext,
) -> Result<Hellos, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let client_hello = match step(ctx, "client hello", receive_message(reader)).await? {
        HandshakeMessage::ClientHello(hello) => hello,
        other => {
            send_alert(writer, AlertCode::UnexpectedMessage).await;
            return Err(other.unexpected("ClientHello"));
        }
    };
    if client_hello.offered_version != agreed.offered {
        send_alert(writer, AlertCode::ProtocolVersion).await;
        return Err(ChannelError::VersionMismatch {
            agreed: agreed.offered,
            hello: client_hello.offered_version,
        });
    }

    let suite = match CryptoSuite::negotiate(&ctx.config.suites, &client_hello.known_suites()) {
        Some(suite) => suite,
        None => {
            send_alert(writer, AlertCode::NoCommonSuite).await;
            return Err(ChannelError::NoCommonSuite);
        }
    };

    let peer_record_size = match peer_record_size(client_hello.record_size) {
        Ok(size) => size,
        Err(e) => {
            send_alert(writer, AlertCode::UnexpectedMessage).await;
            return Err(e);
        }
    };

    let server_hello = ServerHello::new(random_nonce(), agreed.version, suite, own_record_size(ctx));
    send_message(writer, &HandshakeMessage::ServerHello(server_hello.clone())).await?;

    Ok(Hellos {
        suite,
        client_hello: client_hello.to_bytes()?,
        server_hello: server_hello.to_bytes()?,
        peer_record_size,
    })
}

async fn send_key_exchange<W>(
    writer: &mut W,
    public_key: Vec<u8>,
    signature: Vec<u8>,
) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    send_message(
        writer,
        &HandshakeMessage::KeyExchange(KeyExchange {
            public_key,
            signature,
        }),
    )
    .await
}

async fn receive_key_exchange<R>(
    reader: &mut R,
    ctx: &HandshakeContext,
) -> Result<KeyExchange, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match step(ctx, "key exchange", receive_message(reader)).await? {
        HandshakeMessage::KeyExchange(kx) => Ok(kx),
        other => Err(other.unexpected("KeyExchange")),
    }
}

async fn send_certificate<W>(
    sealer: &mut RecordSealer,
    writer: &mut W,
    message: &HandshakeMessage,
) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = message.to_bytes()?;
    sealer
        .write(writer, &(bytes.len() as u32).to_le_bytes())
        .await?;
    sealer.write(writer, &bytes).await?;
    sealer.flush(writer).await?;
    Ok(())
}

async fn receive_certificate<R>(
    opener: &mut RecordOpener,
    reader: &mut R,
    ctx: &HandshakeContext,
) -> Result<Certificate, ChannelError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let read = async {
        let mut buffer = Vec::new();
        let mut expected: Option<usize> = None;
        loop {
            if expected.is_none() && buffer.len() >= 4 {
                let len = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
                if len > MAX_FRAME_SIZE {
                    return Err(ChannelError::FrameTooLarge {
                        size: len,
                        max: MAX_FRAME_SIZE,
                    });
                }
                expected = Some(4 + len);
            }
            if let Some(total) = expected {
                if buffer.len() == total {
                    return Ok(buffer.split_off(4));
                }
                if buffer.len() > total {
                    return Err(ChannelError::Malformed(
                        "data after certificate".to_string(),
                    ));
                }
            }

            let record = opener.read_record(reader).await?.ok_or_else(|| {
                ChannelError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof))
            })?;
            if record.flags != 0 {
                return Err(ChannelError::Malformed(
                    "flags set during certificate exchange".to_string(),
                ));
            }
            buffer.extend_from_slice(&record.payload);
        }
    };

    let payload = step(ctx, "certificate", read).await?;
    match HandshakeMessage::from_bytes(&payload)? {
        HandshakeMessage::Certificate(certificate) => Ok(certificate),
        other => Err(other.unexpected("Certificate")),
    }
}

/// Trust chain, key exchange signature, then revocation.
async fn authenticate(
    ctx: &HandshakeContext,
    certificate: &Certificate,
    previous: Option<&Certificate>,
    signed: &[u8],
    signature: &[u8],
) -> Result<(), ChannelError> {
    if let Some(previous) = previous {
        if previous != certificate {
            return Err(ChannelError::CertificateChanged);
        }
    }
    ctx.trust.verify(certificate, unix_now())?;

    let key = certificate.verifying_key()?;
    verify_signature(signed, signature, &key).map_err(|_| ChannelError::SignatureInvalid)?;

    check_revocation(ctx, certificate).await
}

async fn check_revocation(
    ctx: &HandshakeContext,
    certificate: &Certificate,
) -> Result<(), ChannelError> {
    match tokio::time::timeout(
        ctx.config.handshake_step_timeout(),
        ctx.revocation.is_revoked(certificate),
    )
    .await
    {
        Ok(Ok(true)) => Err(CertificateError::Revoked.into()),
        Ok(Ok(false)) => Ok(()),
        // Revocation is out-of-band; the peer layer keeps re-checking.
        Ok(Err(e)) => {
            warn!(peer = %certificate.email(), "revocation check failed: {}", e);
            Ok(())
        }
        Err(_) => {
            warn!(peer = %certificate.email(), "revocation check timed out");
            Ok(())
        }
    }
}

async fn send_alert<W>(writer: &mut W, code: AlertCode)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if let Err(e) = send_message(writer, &HandshakeMessage::Alert { code }).await {
        debug!("failed to send alert {:?}: {}", code, e);
    }
}

async fn step<T, F>(ctx: &HandshakeContext, name: &'static str, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, ChannelError>>,
{
    tokio::time::timeout(ctx.config.handshake_step_timeout(), fut)
        .await
        .map_err(|_| ChannelError::Timeout(name))?
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}
