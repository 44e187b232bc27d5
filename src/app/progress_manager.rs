//! Progress bars for `run`, fed from the orchestrator's progress stream.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use manuscript_core::{ItemId, ProgressUpdate};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

const BAR_TEMPLATE: &str = "{prefix:>6} [{bar:30}] {pos}/{len} {msg}";

/// Spawns the progress UI when requested.
///
/// Returns the task handle (if any) and the token that stops it.
pub(crate) fn spawn_progress_ui(
    use_bars: bool,
    updates: broadcast::Receiver<ProgressUpdate>,
) -> (Option<tokio::task::JoinHandle<()>>, CancellationToken) {
    let stop = CancellationToken::new();
    if !use_bars {
        stop.cancel();
        return (None, stop);
    }
    let handle = tokio::spawn(render_bars(updates, stop.clone()));
    (Some(handle), stop)
}

async fn render_bars(mut updates: broadcast::Receiver<ProgressUpdate>, stop: CancellationToken) {
    let multi = MultiProgress::new();
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let mut bars: HashMap<ItemId, ProgressBar> = HashMap::new();

    loop {
        let update = tokio::select! {
            () = stop.cancelled() => break,
            received = updates.recv() => match received {
                Ok(update) => update,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        };

        let bar = bars.entry(update.item_id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(0));
            bar.set_style(style.clone());
            bar.set_prefix(format!("#{}", update.item_id));
            bar.enable_steady_tick(Duration::from_millis(200));
            bar
        });
        bar.set_length(update.total_pages as u64);
        bar.set_position(update.downloaded_pages as u64);
        bar.set_message(bar_message(&update));
        if update.state.is_terminal() {
            bar.finish_with_message(bar_message(&update));
        }
    }

    for bar in bars.values() {
        if !bar.is_finished() {
            bar.abandon();
        }
    }
}

/// `"downloading 1.2 MiB 340.0 KiB/s eta 12s"`.
pub(crate) fn bar_message(update: &ProgressUpdate) -> String {
    let mut message = format!(
        "{} {}",
        update.state.as_str(),
        format_bytes(update.downloaded_bytes)
    );
    if update.bytes_per_second > 0.0 {
        message.push_str(&format!(" {}/s", format_rate(update.bytes_per_second)));
    }
    if let Some(eta) = update.eta_seconds {
        message.push_str(&format!(" eta {eta:.0}s"));
    }
    message
}

#[allow(clippy::cast_precision_loss)]
fn format_bytes(bytes: u64) -> String {
    format_rate(bytes as f64)
}

fn format_rate(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
