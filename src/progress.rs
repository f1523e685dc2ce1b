// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Progress reporting.

Subsystems receive a [Progress] handle instead of talking to a terminal
directly. The console implementation renders stacked bars; headless runs
use [NoProgress].
*/

use {
    indicatif::{MultiProgress, ProgressBar, ProgressStyle},
    std::sync::Mutex,
};

/// Identifies one bar started via [Progress::start].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgressId(usize);

/// Capability interface for progress rendering.
pub trait Progress: Send + Sync {
    fn start(&self, name: &str, total: u64) -> ProgressId;
    fn tick(&self, id: ProgressId);
    fn finish(&self, id: ProgressId);
}

/// Discards all progress events.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _name: &str, _total: u64) -> ProgressId {
        ProgressId(0)
    }

    fn tick(&self, _id: ProgressId) {}

    fn finish(&self, _id: ProgressId) {}
}

/// Terminal progress bars.
pub struct ConsoleProgress {
    multi: MultiProgress,
    bars: Mutex<Vec<ProgressBar>>,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(Vec::new()),
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl Progress for ConsoleProgress {
    fn start(&self, name: &str, total: u64) -> ProgressId {
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(
            ProgressStyle::with_template("{msg:>12} [{bar:40}] {pos}/{len}")
                .expect("static template parses")
                .progress_chars("=> "),
        );
        bar.set_message(name.to_string());

        let mut bars = self.bars.lock().expect("progress lock");
        bars.push(bar);

        ProgressId(bars.len() - 1)
    }

    fn tick(&self, id: ProgressId) {
        if let Some(bar) = self.bars.lock().expect("progress lock").get(id.0) {
            bar.inc(1);
        }
    }

    fn finish(&self, id: ProgressId) {
        if let Some(bar) = self.bars.lock().expect("progress lock").get(id.0) {
            bar.finish();
        }
    }
}
