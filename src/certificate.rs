// Copyright 2025 Stairwell, Inc.
// Author: mrdomino@stairwell.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{anyhow, Context};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, SanType,
    PKCS_RSA_SHA256,
};
use rsa::{
    pkcs8::{EncodePrivateKey, LineEnding},
    RsaPrivateKey,
};
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::error::{Error, Result};

pub const KEY_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// A PEM-encoded private key and the self-signed certificate for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralCertificate {
    pub private: String,
    pub cert: String,
}

/// Generates self-signed certificates for the proxy, one per hostname.
///
/// The first request for a hostname generates a key pair and certificate; later
/// requests for the same hostname get the same pair back. Nothing expires, a new
/// provider starts from scratch.
#[derive(Default)]
pub struct CertificateProvider {
    cache: Mutex<HashMap<String, Arc<EphemeralCertificate>>>,
}

impl CertificateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key generation runs on the blocking pool, with the cache unlocked.
    /// Concurrent first requests for one hostname may both generate, but only
    /// the first result is kept and handed out.
    pub async fn get_certificate(&self, hostname: &str) -> Result<Arc<EphemeralCertificate>> {
        if let Some(certificate) = self.lock().get(hostname) {
            return Ok(Arc::clone(certificate));
        }
        let owned = hostname.to_owned();
        let generated = smol::unblock(move || generate(&owned))
            .await
            .map_err(|source| Error::Certificate {
                hostname: hostname.to_owned(),
                source,
            })?;
        let mut cache = self.lock();
        let certificate = cache
            .entry(hostname.to_owned())
            .or_insert_with(|| Arc::new(generated));
        Ok(Arc::clone(certificate))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<EphemeralCertificate>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn generate(hostname: &str) -> anyhow::Result<EphemeralCertificate> {
    debug!(hostname, "generating proxy certificate");
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .context("failed to generate RSA key")?;
    let private = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow!("failed to encode private key: {}", e))?
        .to_string();
    let key_pair = KeyPair::from_pem_and_sign_algo(&private, &PKCS_RSA_SHA256)
        .context("failed to load private key")?;

    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, "Lens Certificate Authority");
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Lens");
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);
    params.subject_alt_names = vec![
        san_for(hostname)?,
        SanType::DnsName("localhost".try_into()?),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];

    let cert = params
        .self_signed(&key_pair)
        .context("failed to sign certificate")?;
    Ok(EphemeralCertificate {
        private,
        cert: cert.pem(),
    })
}

fn san_for(hostname: &str) -> anyhow::Result<SanType> {
    // Url hosts keep the brackets around IPv6 literals.
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ok(SanType::DnsName(hostname.try_into().with_context(|| {
        format!("invalid DNS name '{}'", hostname)
    })?))
}
