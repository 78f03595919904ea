//! Writers for the result files.
use crate::io::{OutputFile, create_file};
use crate::matrix::{Frame, Stats};
use anndata::data::array::dataframe::DataFrameIndex;
use anndata::{AnnData, AnnDataOp, AxisArraysOp};
use anndata_hdf5::H5;
use anyhow::{Context, Result, anyhow};
use nalgebra_sparse::{coo::CooMatrix, csc::CscMatrix, csr::CsrMatrix};
use std::io::Write;
use std::path::Path;

/// Shortest representation that reads back to the same f64,
/// integral values keep a trailing '.0', NaN becomes an empty field.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        String::new()
    } else {
        format!("{value:?}")
    }
}

/// Runs the requested exports, one failing export does not stop the others.
#[derive(Default)]
pub struct Exports {
    written: usize,
    failed: usize,
}

impl Exports {
    pub fn run(&mut self, what: &str, path: &Path, export: impl FnOnce(&Path) -> Result<()>) {
        measure_time::debug_time!("Writing {}", what);
        match export(path) {
            Ok(()) => {
                log::info!("Wrote {} to {}", what, path.display());
                self.written += 1;
            }
            Err(e) => {
                log::error!("Failed to write {} to {}: {:?}", what, path.display(), e);
                self.failed += 1;
            }
        }
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn report(&self) {
        if self.failed > 0 {
            log::warn!(
                "{} of {} exports failed",
                self.failed,
                self.failed + self.written
            );
        } else {
            log::info!("All {} exports written", self.written);
        }
    }
}

pub fn write_stats(path: &Path, stats: &Stats) -> Result<()> {
    let mut out = create_file(path)?;
    out.write_all(b"stat\tcount\n")
        .context("Failed to write header to stats file")?;
    for (key, count) in stats.iter() {
        out.write_all(format!("{key}\t{count}\n").as_bytes())
            .context("Failed to write stats to file")?;
    }
    out.finish()
}

/// Flush a csv writer and finish the file underneath.
pub fn finish_csv(writer: csv::Writer<OutputFile>) -> Result<()> {
    writer
        .into_inner()
        .map_err(|e| anyhow!("Failed to flush csv output: {}", e.error()))?
        .finish()
}

/// Dense frame as delimited text, row names in the first column.
pub fn write_frame<C>(
    path: &Path,
    frame: &Frame<C>,
    delimiter: u8,
    column_name: impl Fn(&C) -> String,
) -> Result<()>
where
    C: Clone + Send + Sync,
{
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_writer(create_file(path)?);
    let mut header = vec![String::new()];
    header.extend(frame.columns.iter().map(column_name));
    writer.write_record(&header)?;
    for (ii, row) in frame.rows.iter().enumerate() {
        let mut record = Vec::with_capacity(frame.columns.len() + 1);
        record.push(row.clone());
        record.extend(frame.row(ii).iter().map(|v| format_float(*v)));
        writer.write_record(&record)?;
    }
    finish_csv(writer)
}

/// Same as [`write_frame`] for integer counts.
pub fn write_count_table(
    path: &Path,
    rows: &[String],
    columns: &[String],
    counts: &CscMatrix<u64>,
) -> Result<()> {
    let mut dense = vec![vec![0u64; columns.len()]; rows.len()];
    for (row, column, value) in counts.triplet_iter() {
        dense[row][column] = *value;
    }
    let mut writer = csv::Writer::from_writer(create_file(path)?);
    let mut header = vec![String::new()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;
    for (name, values) in rows.iter().zip(dense) {
        let mut record = Vec::with_capacity(columns.len() + 1);
        record.push(name.clone());
        record.extend(values.iter().map(|v| v.to_string()));
        writer.write_record(&record)?;
    }
    finish_csv(writer)
}

/// variableStep wiggle track.
/// Entries must be grouped by contig, NaN values are left out.
pub fn write_wig<'a>(
    path: &Path,
    span: u32,
    entries: impl Iterator<Item = (&'a str, u32, f64)>,
) -> Result<()> {
    let mut out = create_file(path)?;
    let mut current: Option<&str> = None;
    for (contig, start, value) in entries {
        if value.is_nan() {
            continue;
        }
        if current != Some(contig) {
            out.write_all(format!("variableStep chrom={contig} span={span}\n").as_bytes())?;
            current = Some(contig);
        }
        out.write_all(format!("{start}\t{}\n", format_float(value)).as_bytes())?;
    }
    out.finish()
}

pub fn write_bincode<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut out = create_file(path)?;
    bincode::serde::encode_into_std_write(value, &mut out, bincode::config::standard())
        .context("Failed to serialize")?;
    out.finish()
}

/// Build a sparse rows x columns matrix from (row, column, value) triplets.
/// Duplicate coordinates are summed.
pub fn sparse_matrix(
    nrows: usize,
    ncols: usize,
    triplets: impl Iterator<Item = (usize, usize, u64)>,
) -> Result<CscMatrix<u64>> {
    let mut rows = Vec::new();
    let mut cols = Vec::new();
    let mut values = Vec::new();
    for (row, col, value) in triplets {
        if value == 0 {
            continue;
        }
        rows.push(row);
        cols.push(col);
        values.push(value);
    }
    let coo = CooMatrix::try_from_triplets(nrows, ncols, rows, cols, values)
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(CscMatrix::from(&coo))
}

/// Matrix Market coordinate format, 1-based, column major.
pub fn write_matrix_market(path: &Path, matrix: &CscMatrix<u64>) -> Result<()> {
    let mut out = create_file(path)?;
    out.write_all(b"%%MatrixMarket matrix coordinate integer general\n")?;
    out.write_all(
        format!("{} {} {}\n", matrix.nrows(), matrix.ncols(), matrix.nnz()).as_bytes(),
    )?;
    for (row, col, value) in matrix.triplet_iter() {
        out.write_all(format!("{} {} {}\n", row + 1, col + 1, value).as_bytes())?;
    }
    out.finish()
}

/// Counts as the u32 CSR matrices h5ad readers expect.
fn anndata_counts(matrix: &CscMatrix<u64>) -> Result<CsrMatrix<u32>> {
    let mut rows = Vec::with_capacity(matrix.nnz());
    let mut cols = Vec::with_capacity(matrix.nnz());
    let mut values = Vec::with_capacity(matrix.nnz());
    for (row, col, value) in matrix.triplet_iter() {
        rows.push(row);
        cols.push(col);
        values.push(u32::try_from(*value).context("Count too large for h5ad")?);
    }
    let coo = CooMatrix::try_from_triplets(matrix.nrows(), matrix.ncols(), rows, cols, values)
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(CsrMatrix::from(&coo))
}

/// AnnData file: obs are the rows, var the columns,
/// `x` becomes X and every layer is stored under its name.
pub fn write_h5ad(
    path: &Path,
    obs_names: &[String],
    var_names: &[String],
    x: &CscMatrix<u64>,
    layers: &[(&str, &CscMatrix<u64>)],
) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            ex::fs::create_dir_all(parent)?;
        }
    }
    let adata = AnnData::<H5>::new(path)
        .with_context(|| format!("Failed to create AnnData file at {}", path.display()))?;
    adata.set_obs_names(obs_names.iter().cloned().collect::<DataFrameIndex>())?;
    adata.set_var_names(var_names.iter().cloned().collect::<DataFrameIndex>())?;
    adata.set_x(anndata_counts(x)?)?;
    for (name, layer) in layers {
        log::debug!("Adding layer {name}");
        adata.layers().add(name, anndata_counts(layer)?)?;
    }
    adata.close()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Read;

    fn read(path: &Path) -> String {
        let mut s = String::new();
        crate::io::open_file(path)
            .unwrap()
            .read_to_string(&mut s)
            .unwrap();
        s
    }

    #[test]
    fn test_format_float() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.5), "0.5");
        assert_eq!(format_float(0.1 + 0.2), "0.30000000000000004");
        assert_eq!(format_float(f64::NAN), "");
        assert_eq!(format_float(0.0), "0.0");
    }

    #[test]
    fn test_write_stats_sorted() {
        let td = tempfile::tempdir().unwrap();
        let mut stats = Stats::default();
        stats.add("records", 10);
        stats.add("duplicate", 2);
        let path = td.path().join("stats.tsv");
        write_stats(&path, &stats).unwrap();
        assert_eq!(read(&path), "stat\tcount\nduplicate\t2\nrecords\t10\n");
    }

    #[test]
    fn test_write_frame() {
        let td = tempfile::tempdir().unwrap();
        let frame = Frame::from_rows(
            vec!["a".to_string(), "b".to_string()],
            vec![1u32, 2],
            vec![vec![1.0, f64::NAN], vec![0.25, 0.0]],
        );
        let path = td.path().join("betas.csv");
        write_frame(&path, &frame, b',', |c| format!("bin{c}")).unwrap();
        assert_eq!(read(&path), ",bin1,bin2\na,1.0,\nb,0.25,0.0\n");
    }

    #[test]
    fn test_write_wig() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("beta.wig");
        let entries = vec![
            ("chr1", 0, 0.5),
            ("chr1", 500, f64::NAN),
            ("chr1", 1000, 1.0),
            ("chr2", 0, 0.0),
        ];
        write_wig(&path, 500, entries.into_iter()).unwrap();
        assert_eq!(
            read(&path),
            "variableStep chrom=chr1 span=500\n0\t0.5\n1000\t1.0\nvariableStep chrom=chr2 span=500\n0\t0.0\n"
        );
    }

    #[test]
    fn test_matrix_market() {
        let td = tempfile::tempdir().unwrap();
        let m = sparse_matrix(
            2,
            3,
            vec![(1, 0, 2), (0, 2, 5), (0, 0, 1), (1, 1, 0)].into_iter(),
        )
        .unwrap();
        assert_eq!(m.nnz(), 3);
        let path = td.path().join("m.mtx.gz");
        write_matrix_market(&path, &m).unwrap();
        assert_eq!(
            read(&path),
            "%%MatrixMarket matrix coordinate integer general\n2 3 3\n1 1 1\n2 1 2\n1 3 5\n"
        );
        let table = td.path().join("m.csv.gz");
        write_count_table(
            &table,
            &["a".to_string(), "b".to_string()],
            &["x".to_string(), "y".to_string(), "z".to_string()],
            &m,
        )
        .unwrap();
        assert_eq!(read(&table), ",x,y,z\na,1,0,5\nb,2,0,0\n");
    }

    #[test]
    fn test_bincode_roundtrip() {
        let td = tempfile::tempdir().unwrap();
        let frame = Frame::from_rows(vec!["a".to_string()], vec![7u32], vec![vec![0.5]]);
        let path = td.path().join("frame.bin");
        write_bincode(&path, &frame).unwrap();
        let mut fh = std::fs::File::open(&path).unwrap();
        let decoded: Frame<u32> =
            bincode::serde::decode_from_std_read(&mut fh, bincode::config::standard()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_exports_continue_after_failure() {
        let td = tempfile::tempdir().unwrap();
        let mut exports = Exports::default();
        exports.run("broken", &td.path().join("a"), |_| Err(anyhow!("nope")));
        exports.run("fine", &td.path().join("b"), |p| {
            std::fs::write(p, "ok")?;
            Ok(())
        });
        assert_eq!(exports.failed(), 1);
        assert!(td.path().join("b").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_truncated_gzip_is_a_failed_export() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("m.mtx.gz");
        std::os::unix::fs::symlink("/dev/full", &path).unwrap();
        let m = sparse_matrix(1, 1, vec![(0, 0, 3)].into_iter()).unwrap();
        let mut exports = Exports::default();
        exports.run("matrix", &path, |p| write_matrix_market(p, &m));
        assert_eq!(exports.failed(), 1);
    }

    #[test]
    fn test_h5ad() {
        use anndata::Backend;
        let td = tempfile::tempdir().unwrap();
        let x = sparse_matrix(2, 3, vec![(0, 0, 1), (1, 2, 4)].into_iter()).unwrap();
        let layer = sparse_matrix(2, 3, vec![(1, 1, 2)].into_iter()).unwrap();
        let path = td.path().join("sub").join("counts.h5ad");
        write_h5ad(
            &path,
            &["c1".to_string(), "c2".to_string()],
            &["g1".to_string(), "g2".to_string(), "g3".to_string()],
            &x,
            &[("spliced", &layer)],
        )
        .unwrap();
        let adata = AnnData::<H5>::open(H5::open(&path).unwrap()).unwrap();
        assert_eq!(adata.n_obs(), 2);
        assert_eq!(adata.n_vars(), 3);
        assert_eq!(adata.obs_names().into_vec(), vec!["c1", "c2"]);
        assert_eq!(adata.var_names().into_vec(), vec!["g1", "g2", "g3"]);
        assert_eq!(adata.layers().keys(), vec!["spliced".to_string()]);
    }
}
