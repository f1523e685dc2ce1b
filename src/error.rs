// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Error handling. */

use thiserror::Error;

/// Primary crate error type.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("URL error: {0:?}")]
    Url(#[from] url::ParseError),

    #[error("hex parsing error: {0:?}")]
    Hex(#[from] hex::FromHexError),

    #[error("PGP error: {0:?}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("date parsing error: {0:?}")]
    DateParse(#[from] mailparse::MailParseError),

    #[error("HTTP error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("I/O error: {0:?}")]
    Io(#[from] std::io::Error),

    #[error("integer parsing error: {0:?}")]
    ParseInt(#[from] std::num::ParseIntError),

    #[error("JSON error: {0:?}")]
    Json(#[from] serde_json::Error),

    #[error("recipe malformed: {0}")]
    RecipeMalformed(String),

    #[error("control file parse error: {0}")]
    ControlParse(String),

    #[error("version string error: {0}")]
    Version(#[from] crate::version::VersionError),

    #[error("failed to parse dependency expression: {0}")]
    DependencyParse(String),

    #[error("required field missing in package stanza: {0}")]
    PackageRequiredFieldMissing(&'static str),

    #[error("package {0} has no download URL")]
    PackageNoUrl(String),

    #[error("package {0} has no SHA256 digest")]
    PackageNoDigest(String),

    #[error("conflicting digests for {0} across sources")]
    PackageDigestConflict(String),

    #[error("no PGP keys configured for source {0}")]
    TrustUnconfigured(String),

    #[error("signature verification failed for {0}")]
    SignatureInvalid(String),

    #[error("release file for {0} expired at {1}")]
    ReleaseExpired(String, String),

    #[error("component {0} not published by {1}")]
    ComponentMissing(String, String),

    #[error("release file does not list a usable Packages index for {0}/{1}")]
    PackagesIndexMissing(String, String),

    #[error("expected 1 paragraph in release file; got {0}")]
    ReleaseParagraphMismatch(usize),

    #[error("malformed index entry in release file: {0}")]
    ReleaseIndexEntryMalformed(String),

    #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
    HashMismatch {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch for {url}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        url: String,
        expected: u64,
        actual: u64,
    },

    #[error("unable to satisfy relation {relation} (via {chain})")]
    Unsatisfiable { relation: String, chain: String },

    #[error("package {0} is required but excluded")]
    Excluded(String),

    #[error("all mirrors failed for package {package}: {causes}")]
    AllMirrorsFailed { package: String, causes: String },

    #[error("unknown member in binary package archive: {0}")]
    DebUnknownMember(String),

    #[error("unknown compression in deb archive member: {0}")]
    DebUnknownCompression(String),

    #[error("binary package archive missing member: {0}")]
    DebMissingMember(&'static str),

    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("build backend failed to start: {0}")]
    BackendStartFailure(String),

    #[error("second stage failed: {0}")]
    SecondStageFailure(String),

    #[error("usr merge collision on {0}")]
    UsrMergeCollision(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Result wrapper for this crate.
pub type Result<T> = std::result::Result<T, BuildError>;
