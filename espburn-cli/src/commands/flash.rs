//! Flash command implementation.

use {
    super::{SessionOptions, connect, ensure_not_interrupted, session_config},
    crate::{Cli, config::Config, use_fancy_output},
    anyhow::{Context, Result},
    console::style,
    espburn::{Event, FlashArgs, FlashFreq, FlashMode, FlashProgress, FlashSize, Partition},
    indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle},
    std::{
        fs,
        path::{Path, PathBuf},
        str::FromStr,
    },
};

/// Arguments of `espburn flash`.
pub(crate) struct FlashOptions<'a> {
    pub bins: &'a [(PathBuf, u32)],
    pub flash_mode: Option<FlashMode>,
    pub flash_freq: Option<FlashFreq>,
    pub flash_size: Option<FlashSize>,
    pub flash_baud: Option<u32>,
    pub compress: bool,
    pub use_stub: bool,
}

/// Flag value, else the config file value, else `keep`.
fn header_option<T>(flag: Option<T>, configured: Option<&str>, what: &str) -> Result<T>
where
    T: FromStr<Err = espburn::Error> + Default,
{
    match (flag, configured) {
        (Some(value), _) => Ok(value),
        (None, Some(text)) => text
            .parse()
            .with_context(|| format!("Invalid {what} in config file")),
        (None, None) => Ok(T::default()),
    }
}

fn load_partitions(bins: &[(PathBuf, u32)], quiet: bool) -> Result<Vec<Partition>> {
    bins.iter()
        .map(|(path, address)| {
            let image = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            if !quiet {
                eprintln!(
                    "    {} {} @ 0x{:08X} ({} bytes)",
                    style("•").dim(),
                    path.display(),
                    address,
                    image.len()
                );
            }
            Ok(Partition::new(*address, image).with_name(file_label(path)))
        })
        .collect()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Draws one bar per partition from [`FlashProgress`] events.
struct ProgressView {
    bar: ProgressBar,
    names: Vec<String>,
    index: Option<usize>,
}

impl ProgressView {
    fn new(names: Vec<String>, visible: bool) -> Self {
        let bar = if visible {
            let bar = ProgressBar::with_draw_target(Some(0), ProgressDrawTarget::stderr());
            #[allow(clippy::unwrap_used)] // Static template string
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            bar
        } else {
            ProgressBar::hidden()
        };
        Self {
            bar,
            names,
            index: None,
        }
    }

    fn update(&mut self, progress: FlashProgress) {
        if self.index != Some(progress.index) {
            if self.index.is_some() {
                self.bar.finish();
                self.bar.reset();
            }
            self.index = Some(progress.index);
            self.bar.set_length(u64::from(progress.blocks_total));
            let name = self
                .names
                .get(progress.index)
                .map_or("partition", String::as_str);
            self.bar.set_message(format!("Writing {name}"));
        }
        // the final confirmation event reports one past the block count
        self.bar
            .set_position(u64::from(progress.blocks_written.min(progress.blocks_total)));
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &mut Config, options: &FlashOptions<'_>) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {} binar{}",
            style("📦").cyan(),
            options.bins.len(),
            if options.bins.len() == 1 { "y" } else { "ies" }
        );
    }
    let partitions = load_partitions(options.bins, cli.quiet)?;
    let names = partitions.iter().map(Partition::label).collect();

    let args = FlashArgs::new(partitions)
        .with_flash_mode(header_option(
            options.flash_mode,
            config.flash.flash_mode.as_deref(),
            "flash_mode",
        )?)
        .with_flash_freq(header_option(
            options.flash_freq,
            config.flash.flash_freq.as_deref(),
            "flash_freq",
        )?)
        .with_flash_size(header_option(
            options.flash_size.clone(),
            config.flash.flash_size.as_deref(),
            "flash_size",
        )?);

    let settings = session_config(
        cli,
        config,
        &SessionOptions {
            use_stub: options.use_stub,
            compress: options.compress,
            flash_baud: options.flash_baud,
        },
    )?;

    let mut view = ProgressView::new(names, !cli.quiet && use_fancy_output());
    let bar = view.bar.clone();
    let mut session = connect(cli, config, settings, move |event| {
        if let Event::Progress(progress) = event {
            view.update(*progress);
        }
    })?;
    ensure_not_interrupted()?;

    let result = session.flash(&args);
    match &result {
        Ok(()) => bar.finish_with_message("Done"),
        Err(_) => bar.abandon(),
    }
    result.context("Flashing failed")?;

    if !cli.quiet {
        eprintln!("\n{} Flashing complete, chip reset", style("🎉").green().bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_option_precedence() {
        let mode: FlashMode = header_option(Some(FlashMode::Qio), Some("dout"), "flash_mode").unwrap();
        assert_eq!(mode, FlashMode::Qio);

        let mode: FlashMode = header_option(None, Some("dout"), "flash_mode").unwrap();
        assert_eq!(mode, FlashMode::Dout);

        let mode: FlashMode = header_option(None, None, "flash_mode").unwrap();
        assert_eq!(mode, FlashMode::Keep);

        assert!(header_option::<FlashFreq>(None, Some("33m"), "flash_freq").is_err());
    }

    #[test]
    fn test_load_partitions_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.bin");
        fs::write(&path, [0xE9, 0, 0, 0]).unwrap();

        let partitions = load_partitions(&[(path, 0x10000)], true).unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].address, 0x10000);
        assert_eq!(partitions[0].label(), "app.bin");

        let missing = dir.path().join("missing.bin");
        assert!(load_partitions(&[(missing, 0)], true).is_err());
    }

    #[test]
    fn test_progress_view_tracks_partitions() {
        let mut view = ProgressView::new(vec!["boot.bin".into(), "app.bin".into()], false);
        view.update(FlashProgress {
            index: 0,
            blocks_written: 1,
            blocks_total: 2,
        });
        assert_eq!(view.bar.position(), 1);

        view.update(FlashProgress {
            index: 1,
            blocks_written: 4,
            blocks_total: 3,
        });
        assert_eq!(view.index, Some(1));
        assert_eq!(view.bar.length(), Some(3));
        assert_eq!(view.bar.position(), 3);
    }
}
