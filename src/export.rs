use std::fs::File;
use std::path::{Path, PathBuf};

use crate::listing::DigestRow;
use crate::Result;

pub fn digest_path(dir: &Path, day: &str) -> PathBuf {
    dir.join(format!("motorcycles_{day}.csv"))
}

/// Writes the header even when there are no rows.
pub fn save_to_csv(rows: &[DigestRow], path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    writer.write_record(DigestRow::HEADER)?;
    for row in rows {
        writer.serialize(row)?;
    }

    writer.flush()?;
    Ok(())
}
