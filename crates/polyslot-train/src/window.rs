//! Dataset file windows
//!
//! Pure functions computing the `[min, max)` file-index range a batch source
//! reads for one train or test epoch.

use crate::config::RunConfig;
use std::fmt;

/// Half-open range of file indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileWindow {
    pub min: usize,
    pub max: usize,
}

impl FileWindow {
    pub fn len(&self) -> usize {
        self.max.saturating_sub(self.min)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for FileWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Number of files actually fed for a requested count
fn fed_files(requested: usize, multiplier: f64) -> usize {
    (requested as f64 * multiplier).floor() as usize
}

/// Training window: starts at the resume file marker
///
/// # Arguments
/// * `start_file` - First file index (nonzero when resuming)
/// * `requested` - Files requested per epoch
/// * `multiplier` - Oversampling factor
pub fn train_window(start_file: usize, requested: usize, multiplier: f64) -> FileWindow {
    FileWindow {
        min: start_file,
        max: start_file + fed_files(requested, multiplier),
    }
}

/// Test window: starts after the training split when a validation set is reserved
///
/// # Arguments
/// * `total_files` - Number of files in the dataset
/// * `split_fraction` - Fraction of files used for training
/// * `reserve_validation_set` - Whether the tail of the dataset is held out
/// * `requested` - Files requested per epoch
/// * `multiplier` - Oversampling factor
pub fn test_window(
    total_files: usize,
    split_fraction: f64,
    reserve_validation_set: bool,
    requested: usize,
    multiplier: f64,
) -> FileWindow {
    let min = if reserve_validation_set {
        (total_files as f64 * split_fraction).floor() as usize
    } else {
        0
    };
    FileWindow {
        min,
        max: min + fed_files(requested, multiplier),
    }
}

/// Window for one phase, or `None` when the data feed is not file-windowed
pub fn window_for(config: &RunConfig, training: bool) -> Option<FileWindow> {
    let data = &config.data;
    if !data.windowed {
        return None;
    }
    Some(if training {
        train_window(config.run.start_file, data.train_files, data.feed_multiplier)
    } else {
        test_window(
            data.dataset_files,
            data.split_fraction,
            data.reserve_validation_set,
            data.test_files,
            data.feed_multiplier,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfigFile;
    use proptest::prelude::*;

    #[test]
    fn test_test_window_with_validation_split() {
        let window = test_window(100, 0.9, true, 5, 1.0);
        assert_eq!(window, FileWindow { min: 90, max: 95 });
    }

    #[test]
    fn test_test_window_without_validation_split() {
        let window = test_window(100, 0.9, false, 5, 1.0);
        assert_eq!(window, FileWindow { min: 0, max: 5 });
    }

    #[test]
    fn test_train_window_starts_at_resume_file() {
        assert_eq!(train_window(7, 3, 2.0), FileWindow { min: 7, max: 13 });
        // Fractional feeds are floored
        assert_eq!(train_window(0, 3, 1.5), FileWindow { min: 0, max: 4 });
    }

    #[test]
    fn test_window_for_non_windowed_feed() {
        let mut file = RunConfigFile::default();
        file.data.windowed = false;
        let config = RunConfig::new(file).unwrap();
        assert_eq!(window_for(&config, true), None);
        assert_eq!(window_for(&config, false), None);
    }

    #[test]
    fn test_window_display() {
        assert_eq!(FileWindow { min: 90, max: 95 }.to_string(), "[90, 95)");
    }

    proptest! {
        #[test]
        fn prop_window_length_is_floored_feed(
            start in 0usize..1000,
            requested in 0usize..500,
            multiplier in 0.0f64..8.0,
        ) {
            let window = train_window(start, requested, multiplier);
            prop_assert_eq!(window.min, start);
            prop_assert_eq!(window.len(), (requested as f64 * multiplier).floor() as usize);
        }

        #[test]
        fn prop_test_window_starts_inside_dataset(
            total in 0usize..10_000,
            split in 0.0f64..=1.0,
            requested in 0usize..100,
        ) {
            let window = test_window(total, split, true, requested, 1.0);
            prop_assert!(window.min <= total);
            prop_assert_eq!(window.len(), requested);
        }
    }
}
