//! Dependency-layer cache boundary check
//!
//! Installing the dashboard's Python dependencies is the slowest step of
//! the image build. Docker reuses a layer only while every earlier layer
//! is unchanged, so the manifest has to be copied and installed on its
//! own, before the application source arrives:
//!
//! ```text
//! COPY requirements.txt ./               ← changes rarely
//! RUN pip install -r requirements.txt    ← cached while the manifest is
//! COPY app ./app                         ← changes on every commit
//! ```
//!
//! `COPY . .` before the install step silently turns every source edit
//! into a full dependency reinstall. This module parses a Dockerfile and
//! rejects that ordering.

pub mod check;
pub mod dockerfile;

pub use check::{check_cache_boundary, check_file, LayerError, LayerReport};
pub use dockerfile::{parse_dockerfile, Instruction, ParseError, Stage};
