/*!
# CSV persistence

The controller streams each chain into its own file. The file name for chain `i` is derived
from a single path by appending `_<i>` to the stem, so `out/chain.csv` becomes
`out/chain_0.csv`, `out/chain_1.csv`, and so on. Every chain file has the header
`dim_0,dim_1,…` followed by one row per retained sample.

Evaluation files use the same naming scheme. Their header is `log_pdf`, or
`log_pdf,log_likelihood,log_prior` when the target is a posterior that exposes its prior.

Values are written with Rust's shortest round-trip float formatting, so
[`load_samples`] reconstructs a run bit for bit.

# Examples

```rust
use asktell_mcmc::io::csv::{load_samples, save_chains};
use ndarray::arr3;

let dir = std::env::temp_dir().join("asktell_mcmc_doc");
std::fs::create_dir_all(&dir)?;
let path = dir.join("chain.csv");

let data = arr3(&[[[1.0, 2.0], [1.5, 2.5]], [[0.1, 0.2], [0.3, 0.4]]]);
save_chains(&data, &path)?;
assert_eq!(load_samples(&path, 2)?, data);
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

use std::fs::File;
use std::path::{Path, PathBuf};

use ::csv::{Reader, Writer};
use ndarray::{Array2, Array3, Axis};

use crate::error::{McmcError, Result};

/// Path of the file holding chain `index`: `dir/stem.ext` becomes `dir/stem_<index>.ext`.
pub fn chain_file_name(path: impl AsRef<Path>, index: usize) -> PathBuf {
    let path = path.as_ref();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(name)
}

/**
A CSV file written one row at a time.

Each row is flushed as soon as it is written, so a run that stops early leaves complete
files behind.
*/
pub struct RowWriter {
    wtr: Writer<File>,
    columns: usize,
}

impl RowWriter {
    pub fn create<S: AsRef<str>>(path: impl AsRef<Path>, header: &[S]) -> Result<Self> {
        let mut wtr = Writer::from_writer(File::create(path)?);
        wtr.write_record(header.iter().map(|h| h.as_ref()))?;
        wtr.flush()?;
        Ok(Self {
            wtr,
            columns: header.len(),
        })
    }

    /// Chain file with columns `dim_0..dim_{n_parameters-1}`.
    pub fn chain(path: impl AsRef<Path>, n_parameters: usize) -> Result<Self> {
        let header: Vec<String> = (0..n_parameters).map(|i| format!("dim_{i}")).collect();
        Self::create(path, &header)
    }

    /// Evaluation file. With `decomposed` the likelihood and prior terms get their own
    /// columns.
    pub fn evaluations(path: impl AsRef<Path>, decomposed: bool) -> Result<Self> {
        if decomposed {
            Self::create(path, &["log_pdf", "log_likelihood", "log_prior"])
        } else {
            Self::create(path, &["log_pdf"])
        }
    }

    pub fn write_row(&mut self, row: &[f64]) -> Result<()> {
        if row.len() != self.columns {
            return Err(McmcError::construction(format!(
                "row has {} values but the file has {} columns",
                row.len(),
                self.columns
            )));
        }
        self.wtr.write_record(row.iter().map(|v| v.to_string()))?;
        self.wtr.flush()?;
        Ok(())
    }
}

/// Writes every chain of `data` (`[chain][sample][parameter]`) to its own file.
pub fn save_chains(data: &Array3<f64>, path: impl AsRef<Path>) -> Result<()> {
    let n_parameters = data.len_of(Axis(2));
    for (i, chain) in data.axis_iter(Axis(0)).enumerate() {
        let mut wtr = RowWriter::chain(chain_file_name(&path, i), n_parameters)?;
        for sample in chain.axis_iter(Axis(0)) {
            wtr.write_row(&sample.to_vec())?;
        }
    }
    Ok(())
}

/**
Writes all chains into a single long-format file with columns `chain,sample,dim_0,…`.

Useful for handing a finished run to plotting tools that expect tidy data.
*/
pub fn save_csv(data: &Array3<f64>, path: impl AsRef<Path>) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);
    let n_dims = data.len_of(Axis(2));

    let mut header = vec!["chain".to_string(), "sample".to_string()];
    header.extend((0..n_dims).map(|i| format!("dim_{i}")));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in data.axis_iter(Axis(0)).enumerate() {
        for (sample_idx, sample) in chain.axis_iter(Axis(0)).enumerate() {
            let mut row = vec![chain_idx.to_string(), sample_idx.to_string()];
            row.extend(sample.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

/// Reads one file written by [`RowWriter`] into an array of shape `[row][column]`.
pub fn load_chain(path: impl AsRef<Path>) -> Result<Array2<f64>> {
    let mut rdr = Reader::from_path(path)?;
    let columns = rdr.headers()?.len();
    let mut values = Vec::new();
    let mut rows = 0;
    for record in rdr.records() {
        let record = record?;
        for field in record.iter() {
            values.push(field.trim().parse::<f64>()?);
        }
        rows += 1;
    }
    Array2::from_shape_vec((rows, columns), values)
        .map_err(|e| McmcError::construction(format!("malformed chain file: {e}")))
}

/// Reads `n_chains` chain files derived from `path` with [`chain_file_name`].
pub fn load_samples(path: impl AsRef<Path>, n_chains: usize) -> Result<Array3<f64>> {
    let chains = (0..n_chains)
        .map(|i| load_chain(chain_file_name(&path, i)))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
    ndarray::stack(Axis(0), &views)
        .map_err(|e| McmcError::construction(format!("chain files differ in shape: {e}")))
}
