// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs::File;
use std::io::Stdout;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::writer::EitherWriter;
use tracing_subscriber::fmt::writer::Tee;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Target for lines relayed from downloaded guest logs. These go to the
/// console only, since the logs themselves are kept next to the run log.
pub const GUEST_LOG_TARGET: &str = "guest_log";

/// Installs the global subscriber, writing to stdout and `log_file`.
///
/// The filter comes from `LISV_LOG` (`tracing_subscriber` target syntax) and
/// defaults to `DEBUG`.
pub fn try_init_tracing(log_file: File) -> Result<(), tracing_subscriber::util::TryInitError> {
    let default = || Targets::new().with_default(LevelFilter::DEBUG);
    let targets = match std::env::var("LISV_LOG") {
        Ok(var) => var.parse().unwrap_or_else(|err| {
            eprintln!("ignoring invalid LISV_LOG {var:?}: {err}");
            default()
        }),
        Err(_) => default(),
    };
    tracing_subscriber::fmt()
        .compact()
        .with_ansi(false) // avoid polluting logs with escape sequences
        .log_internal_errors(true)
        .with_writer(LisvWriter::new(log_file))
        .with_max_level(LevelFilter::TRACE)
        .finish()
        .with(targets)
        .try_init()
}

struct LisvWriter {
    log_file: File,
}

impl LisvWriter {
    fn new(log_file: File) -> Self {
        Self { log_file }
    }
}

impl<'a> MakeWriter<'a> for LisvWriter {
    type Writer = EitherWriter<Stdout, Tee<Stdout, &'a File>>;

    fn make_writer(&'a self) -> Self::Writer {
        // When unknown err on the side of logging too much.
        EitherWriter::B(Tee::new(std::io::stdout(), &self.log_file))
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        if meta.target() == GUEST_LOG_TARGET {
            EitherWriter::A(std::io::stdout())
        } else {
            EitherWriter::B(Tee::new(std::io::stdout(), &self.log_file))
        }
    }
}
