//! Key usage translation
//!
//! CertificateSigningRequests carry abstract usage tokens ("digital
//! signature", "server auth", ...); the PKI backend wants the X.509 key-usage
//! bitmask and extended-usage identifiers. The translation is a fixed table:
//! anything outside it fails the whole request, with every bad token
//! reported at once.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use crate::{Error, Result};

/// X.509 key usage bits
///
/// Bit positions follow RFC 5280 so the mask can be handed to the backend
/// as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KeyUsage(u16);

impl KeyUsage {
    /// digitalSignature
    pub const DIGITAL_SIGNATURE: KeyUsage = KeyUsage(1 << 0);
    /// contentCommitment (a.k.a. nonRepudiation)
    pub const CONTENT_COMMITMENT: KeyUsage = KeyUsage(1 << 1);
    /// keyEncipherment
    pub const KEY_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 2);
    /// dataEncipherment
    pub const DATA_ENCIPHERMENT: KeyUsage = KeyUsage(1 << 3);
    /// keyAgreement
    pub const KEY_AGREEMENT: KeyUsage = KeyUsage(1 << 4);
    /// keyCertSign
    pub const CERT_SIGN: KeyUsage = KeyUsage(1 << 5);
    /// cRLSign
    pub const CRL_SIGN: KeyUsage = KeyUsage(1 << 6);
    /// encipherOnly
    pub const ENCIPHER_ONLY: KeyUsage = KeyUsage(1 << 7);
    /// decipherOnly
    pub const DECIPHER_ONLY: KeyUsage = KeyUsage(1 << 8);

    /// The empty mask
    pub const fn empty() -> Self {
        KeyUsage(0)
    }

    /// Whether every bit of `other` is set in `self`
    pub const fn contains(self, other: KeyUsage) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no bit is set
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Raw bit value
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Names of the set bits, in bit order, as the PKI backend spells them
    pub fn names(self) -> Vec<&'static str> {
        const TABLE: &[(KeyUsage, &str)] = &[
            (KeyUsage::DIGITAL_SIGNATURE, "DigitalSignature"),
            (KeyUsage::CONTENT_COMMITMENT, "ContentCommitment"),
            (KeyUsage::KEY_ENCIPHERMENT, "KeyEncipherment"),
            (KeyUsage::DATA_ENCIPHERMENT, "DataEncipherment"),
            (KeyUsage::KEY_AGREEMENT, "KeyAgreement"),
            (KeyUsage::CERT_SIGN, "CertSign"),
            (KeyUsage::CRL_SIGN, "CRLSign"),
            (KeyUsage::ENCIPHER_ONLY, "EncipherOnly"),
            (KeyUsage::DECIPHER_ONLY, "DecipherOnly"),
        ];
        TABLE
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl BitOr for KeyUsage {
    type Output = KeyUsage;

    fn bitor(self, rhs: KeyUsage) -> KeyUsage {
        KeyUsage(self.0 | rhs.0)
    }
}

impl BitOrAssign for KeyUsage {
    fn bitor_assign(&mut self, rhs: KeyUsage) {
        self.0 |= rhs.0;
    }
}

/// X.509 extended key usages, in their standard numeric order
///
/// The derived `Ord` follows declaration order, which is the numeric order
/// the deterministic output relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExtKeyUsage {
    /// anyExtendedKeyUsage
    Any,
    /// id-kp-serverAuth
    ServerAuth,
    /// id-kp-clientAuth
    ClientAuth,
    /// id-kp-codeSigning
    CodeSigning,
    /// id-kp-emailProtection
    EmailProtection,
    /// id-kp-ipsecEndSystem
    IpsecEndSystem,
    /// id-kp-ipsecTunnel
    IpsecTunnel,
    /// id-kp-ipsecUser
    IpsecUser,
    /// id-kp-timeStamping
    TimeStamping,
    /// id-kp-OCSPSigning
    OcspSigning,
    /// Microsoft server gated crypto
    MicrosoftServerGatedCrypto,
    /// Netscape server gated crypto
    NetscapeServerGatedCrypto,
}

impl ExtKeyUsage {
    /// Name as the PKI backend spells it
    pub const fn name(self) -> &'static str {
        match self {
            ExtKeyUsage::Any => "Any",
            ExtKeyUsage::ServerAuth => "ServerAuth",
            ExtKeyUsage::ClientAuth => "ClientAuth",
            ExtKeyUsage::CodeSigning => "CodeSigning",
            ExtKeyUsage::EmailProtection => "EmailProtection",
            ExtKeyUsage::IpsecEndSystem => "IPSECEndSystem",
            ExtKeyUsage::IpsecTunnel => "IPSECTunnel",
            ExtKeyUsage::IpsecUser => "IPSECUser",
            ExtKeyUsage::TimeStamping => "TimeStamping",
            ExtKeyUsage::OcspSigning => "OCSPSigning",
            ExtKeyUsage::MicrosoftServerGatedCrypto => "MicrosoftServerGatedCrypto",
            ExtKeyUsage::NetscapeServerGatedCrypto => "NetscapeServerGatedCrypto",
        }
    }
}

impl fmt::Display for ExtKeyUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Translate request usage tokens into the backend's native forms
///
/// Key-usage bits OR together; extended usages deduplicate and come out in
/// ascending numeric order regardless of input order. Unrecognized tokens
/// fail the translation with all of them listed.
pub fn key_usages_from_strings(usages: &[String]) -> Result<(KeyUsage, Vec<ExtKeyUsage>)> {
    let mut key_usage = KeyUsage::empty();
    let mut ext_usages = BTreeSet::new();
    let mut unrecognized = Vec::new();

    for usage in usages {
        match usage.as_str() {
            "signing" | "digital signature" => key_usage |= KeyUsage::DIGITAL_SIGNATURE,
            "content commitment" => key_usage |= KeyUsage::CONTENT_COMMITMENT,
            "key encipherment" => key_usage |= KeyUsage::KEY_ENCIPHERMENT,
            "key agreement" => key_usage |= KeyUsage::KEY_AGREEMENT,
            "data encipherment" => key_usage |= KeyUsage::DATA_ENCIPHERMENT,
            "cert sign" => key_usage |= KeyUsage::CERT_SIGN,
            "crl sign" => key_usage |= KeyUsage::CRL_SIGN,
            "encipher only" => key_usage |= KeyUsage::ENCIPHER_ONLY,
            "decipher only" => key_usage |= KeyUsage::DECIPHER_ONLY,
            "any" => {
                ext_usages.insert(ExtKeyUsage::Any);
            }
            "server auth" => {
                ext_usages.insert(ExtKeyUsage::ServerAuth);
            }
            "client auth" => {
                ext_usages.insert(ExtKeyUsage::ClientAuth);
            }
            "code signing" => {
                ext_usages.insert(ExtKeyUsage::CodeSigning);
            }
            "email protection" | "s/mime" => {
                ext_usages.insert(ExtKeyUsage::EmailProtection);
            }
            "ipsec end system" => {
                ext_usages.insert(ExtKeyUsage::IpsecEndSystem);
            }
            "ipsec tunnel" => {
                ext_usages.insert(ExtKeyUsage::IpsecTunnel);
            }
            "ipsec user" => {
                ext_usages.insert(ExtKeyUsage::IpsecUser);
            }
            "timestamping" => {
                ext_usages.insert(ExtKeyUsage::TimeStamping);
            }
            "ocsp signing" => {
                ext_usages.insert(ExtKeyUsage::OcspSigning);
            }
            "microsoft sgc" => {
                ext_usages.insert(ExtKeyUsage::MicrosoftServerGatedCrypto);
            }
            "netscape sgc" => {
                ext_usages.insert(ExtKeyUsage::NetscapeServerGatedCrypto);
            }
            other => unrecognized.push(other.to_string()),
        }
    }

    if !unrecognized.is_empty() {
        return Err(Error::UnrecognizedUsages(unrecognized));
    }
    Ok((key_usage, ext_usages.into_iter().collect()))
}
