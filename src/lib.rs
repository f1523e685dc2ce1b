// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Reproducible Debian base system images.

This crate builds multi-platform OCI image archives containing minimal
Debian base systems, from declarative YAML recipes. It reimplements the
classic bootstrapping pipeline in pure Rust: fetch and verify signed
repository indices, resolve a dependency-closed package selection,
download and verify the archives, unpack them into deterministic layer
inputs, and assemble an OCI image whose second stage finalizes dpkg
configuration inside the image.

# A Tour of Functionality

Repository metadata starts in the [control] module, which parses the
paragraph syntax shared by `Packages` indices, `Release` files, and dpkg
databases. [release::ReleaseFile] models a signed suite manifest;
[source::Source] expands configured repositories into verified
[source::Component]s whose `Packages` indices parse into [package::Package]
values held by a [database::PackageDB].

Selection happens in [resolve]: seeds and exclusions in, a deterministic,
dependency-closed [resolve::Selection] out. Version ordering follows
Debian policy via [version::PackageVersion]; the relation grammar lives in
[dependency].

Acquisition and unpacking are [download] and [unpack], backed by the
conditional-GET [cache::DiskCache] through [client::CachingClient].
[build::ImageAssembler] composes layers and writes the archive using the
[oci] primitives. The [secondstage] module is what runs inside the image.

# Determinism

Given identical recipes, sources, and cache state, every emitted artifact
is byte-identical: iteration orders are total, archive entry metadata is
clamped to the source date epoch, and parallelism is never observable in
outputs.
*/

pub mod build;
pub mod cache;
pub mod client;
pub mod control;
pub mod database;
pub mod dependency;
pub mod download;
pub mod error;
pub mod io;
pub mod oci;
pub mod package;
pub mod progress;
pub mod recipe;
pub mod release;
pub mod resolve;
pub mod secondstage;
pub mod slim;
pub mod source;
pub mod unpack;
pub mod version;
