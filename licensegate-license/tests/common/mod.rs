//! Shared test helpers for license tests: a deterministic signing key
//! standing in for the license server, and a scripted transport.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use licensegate_crypto::{canonicalize_json, SignatureVerifier};
use licensegate_license::{
    CacheBackend, Clock, EntitlementConfig, EntitlementManager, LicenseError, LicenseRequest,
    LicenseResult, LicenseTransport, ManualClock, RetryPolicy, StateResolver, DAY_SECS,
};
use rand::{rngs::StdRng, SeedableRng};
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// A fixed point in time all tests start from.
pub const T0: i64 = 1_800_000_000;

/// Returns the server key, generated once per test binary.
pub fn server_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(42);
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    })
}

/// A key the client does not trust.
pub fn rogue_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(666);
        RsaPrivateKey::new(&mut rng, 2048).unwrap()
    })
}

/// Verifier pinned to [`server_key`].
pub fn verifier() -> SignatureVerifier {
    let pem = RsaPublicKey::from(server_key())
        .to_public_key_pem(LineEnding::LF)
        .unwrap();
    SignatureVerifier::from_pem(&pem).unwrap()
}

/// Signs raw bytes with `key`, returning base64.
pub fn sign_bytes(key: &RsaPrivateKey, data: &[u8]) -> String {
    let signing_key = SigningKey::<Sha256>::new(key.clone());
    BASE64.encode(signing_key.sign(data).to_bytes())
}

/// Adds a `signature` over the canonical form of `body`, as the server does.
pub fn sign_with(key: &RsaPrivateKey, body: Value) -> Value {
    let signature = sign_bytes(key, canonicalize_json(&body).as_bytes());
    let mut signed = body;
    signed
        .as_object_mut()
        .unwrap()
        .insert("signature".to_string(), Value::String(signature));
    signed
}

/// Signs with the trusted server key.
pub fn sign(body: Value) -> Value {
    sign_with(server_key(), body)
}

/// A flat validation response for an active license.
pub fn active_response(expires_at: i64) -> Value {
    json!({
        "valid": true,
        "license": {
            "status": "active",
            "features": {"pro": true, "seats": 5},
            "expires_at": expires_at,
            "hardware_id": "hw-1",
            "activations_limit": 3,
            "activations_count": 1
        },
        "timestamp": T0
    })
}

pub fn config() -> EntitlementConfig {
    EntitlementConfig {
        product_id: "prod-1".to_string(),
        environment: "test".to_string(),
        ..Default::default()
    }
}

pub fn clock() -> ManualClock {
    ManualClock::new(T0)
}

/// Resolver pinned to the server key.
pub fn resolver(clock: &ManualClock) -> StateResolver {
    StateResolver::new(&config(), Some(Arc::new(verifier())), Arc::new(clock.clone()))
}

/// Manager over `transport` that never sleeps between attempts.
pub fn manager(clock: &ManualClock, transport: Arc<MockTransport>) -> EntitlementManager {
    EntitlementManager::builder(config())
        .verifier(verifier())
        .transport(transport)
        .clock(Arc::new(clock.clone()))
        .retry_policy(RetryPolicy::none())
        .build()
        .unwrap()
}

/// Days as seconds.
pub fn days(n: i64) -> i64 {
    n * DAY_SECS
}

/// Returns the clock's current time.
pub fn now(clock: &ManualClock) -> i64 {
    clock.now_secs()
}

/// Transport that replays scripted results and fails like an offline
/// network once the script runs out.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<LicenseResult<Value>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<LicenseRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_ok(&self, response: Value) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_err(&self, err: LicenseError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<LicenseRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn next(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LicenseError::Network("connection refused".to_string())))
    }
}

#[async_trait]
impl LicenseTransport for MockTransport {
    async fn validate(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.next(request)
    }

    async fn check_feature(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.next(request)
    }

    async fn activate(&self, request: &LicenseRequest) -> LicenseResult<Value> {
        self.next(request)
    }
}

/// Backend whose contents the test can reach into.
#[derive(Debug, Clone, Default)]
pub struct SharedBackend {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl SharedBackend {
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    pub fn edit(&self, key: &str, f: impl FnOnce(&mut Value)) {
        let mut entries = self.entries.lock().unwrap();
        let raw = entries.get_mut(key).unwrap();
        let mut value: Value = serde_json::from_str(raw).unwrap();
        f(&mut value);
        *raw = value.to_string();
    }

    pub fn overwrite(&self, key: &str, raw: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), raw.to_string());
    }
}

impl CacheBackend for SharedBackend {
    fn load(&self, key: &str) -> LicenseResult<Option<String>> {
        Ok(self.raw(key))
    }

    fn store(&mut self, key: &str, entry: String) -> LicenseResult<()> {
        self.overwrite(key, &entry);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> LicenseResult<bool> {
        Ok(self.entries.lock().unwrap().remove(key).is_some())
    }

    fn keys(&self) -> LicenseResult<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}
