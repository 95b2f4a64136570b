//! Tab-separated result writers

use crate::constants::NUCLEOTIDES;
use crate::parse::SequenceRecord;
use anyhow::{ensure, Context, Result};
use ndarray::{ArrayView2, ArrayView3, Axis};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer)
}

/// Buffered file for one of the writers below
pub fn create_output<P: AsRef<Path>>(path: P) -> Result<BufWriter<File>> {
    let path = path.as_ref();
    let file = File::create(path).with_context(|| format!("Failed to create output file: {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn embedding_header(prefix: &[&str], hidden: usize) -> Vec<String> {
    prefix
        .iter()
        .map(|s| s.to_string())
        .chain((0..hidden).map(|i| format!("e{i}")))
        .collect()
}

/// Write per-position distributions
///
/// One row per `(sequence, position)`: `id, position, base, A, C, G, T`,
/// where `base` is the observed nucleotide.
pub fn write_probabilities<W: Write>(writer: W, records: &[SequenceRecord], probs: ArrayView3<'_, f32>) -> Result<()> {
    ensure!(
        probs.len_of(Axis(0)) == records.len(),
        "{} probability blocks for {} records",
        probs.len_of(Axis(0)),
        records.len()
    );
    let mut out = tsv_writer(writer);
    let mut header = vec!["id".to_string(), "position".to_string(), "base".to_string()];
    header.extend(NUCLEOTIDES.iter().map(|&b| char::from(b).to_string()));
    out.write_record(&header)?;

    for (record, block) in records.iter().zip(probs.axis_iter(Axis(0))) {
        ensure!(
            block.nrows() == record.sequence.len(),
            "{} positions for {} of length {}",
            block.nrows(),
            record.id,
            record.sequence.len()
        );
        for ((pos, base), dist) in record.sequence.chars().enumerate().zip(block.rows()) {
            let mut row = vec![record.id.clone(), pos.to_string(), base.to_string()];
            row.extend(dist.iter().map(|p| p.to_string()));
            out.write_record(&row)?;
        }
    }
    out.flush().context("Failed to flush probability output")?;
    Ok(())
}

/// Write one embedding row per sequence: `id, e0 .. eH`
pub fn write_sequence_embeddings<W: Write>(writer: W, ids: &[String], embeddings: ArrayView2<'_, f32>) -> Result<()> {
    ensure!(
        embeddings.nrows() == ids.len(),
        "{} embeddings for {} records",
        embeddings.nrows(),
        ids.len()
    );
    let mut out = tsv_writer(writer);
    out.write_record(embedding_header(&["id"], embeddings.ncols()))?;
    for (id, emb) in ids.iter().zip(embeddings.rows()) {
        let row = std::iter::once(id.clone()).chain(emb.iter().map(|v| v.to_string()));
        out.write_record(row)?;
    }
    out.flush().context("Failed to flush embedding output")?;
    Ok(())
}

/// Write one embedding row per nucleotide: `id, position, e0 .. eH`
pub fn write_position_embeddings<W: Write>(writer: W, ids: &[String], embeddings: ArrayView3<'_, f32>) -> Result<()> {
    let (n, _, hidden) = embeddings.dim();
    ensure!(n == ids.len(), "{} embedding blocks for {} records", n, ids.len());
    let mut out = tsv_writer(writer);
    out.write_record(embedding_header(&["id", "position"], hidden))?;
    for (id, block) in ids.iter().zip(embeddings.axis_iter(Axis(0))) {
        for (pos, emb) in block.rows().into_iter().enumerate() {
            let row = [id.clone(), pos.to_string()]
                .into_iter()
                .chain(emb.iter().map(|v| v.to_string()));
            out.write_record(row)?;
        }
    }
    out.flush().context("Failed to flush embedding output")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array3};

    fn lines(buf: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(buf).lines().map(str::to_string).collect()
    }

    #[test]
    fn test_write_probabilities() {
        let records = vec![SequenceRecord { id: "s1".into(), sequence: "AC".into() }];
        let probs = Array3::from_shape_vec((1, 2, 4), vec![0.25, 0.25, 0.25, 0.25, 0.0, 1.0, 0.0, 0.0]).unwrap();
        let mut buf = Vec::new();
        write_probabilities(&mut buf, &records, probs.view()).unwrap();

        let lines = lines(&buf);
        assert_eq!(lines[0], "id\tposition\tbase\tA\tC\tG\tT");
        assert_eq!(lines[1], "s1\t0\tA\t0.25\t0.25\t0.25\t0.25");
        assert_eq!(lines[2], "s1\t1\tC\t0\t1\t0\t0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_write_probabilities_rejects_length_mismatch() {
        let records = vec![SequenceRecord { id: "s1".into(), sequence: "ACG".into() }];
        let probs = Array3::<f32>::zeros((1, 2, 4));
        assert!(write_probabilities(Vec::new(), &records, probs.view()).is_err());
    }

    #[test]
    fn test_write_sequence_embeddings() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let emb = array![[1.0f32, 2.0], [3.0, 4.5]];
        let mut buf = Vec::new();
        write_sequence_embeddings(&mut buf, &ids, emb.view()).unwrap();
        assert_eq!(lines(&buf), vec!["id\te0\te1", "a\t1\t2", "b\t3\t4.5"]);
    }

    #[test]
    fn test_write_position_embeddings() {
        let ids = vec!["a".to_string()];
        let emb = Array3::from_shape_vec((1, 2, 1), vec![0.5f32, 1.5]).unwrap();
        let mut buf = Vec::new();
        write_position_embeddings(&mut buf, &ids, emb.view()).unwrap();
        assert_eq!(lines(&buf), vec!["id\tposition\te0", "a\t0\t0.5", "a\t1\t1.5"]);
    }
}
