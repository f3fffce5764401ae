/// Readers for the instrument and demultiplexer statistics files
/// (RunInfo.xml, DemultiplexingStats.xml, Stats.json, ConversionStats.xml).
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, warn};
use roxmltree::{Document, Node};
use serde::Deserialize;

use crate::config::defs::{CONVERSION_STATS_XML, DEMUX_STATS_XML, RUN_INFO, STATS_JSON};
use crate::utils::file::glob_under;

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name(name))
}

fn children<'a, 'input: 'a>(node: Node<'a, 'input>, name: &'a str) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.has_tag_name(name))
}

fn named<'a, 'input: 'a>(node: Node<'a, 'input>, tag: &'a str, name: &str) -> Option<Node<'a, 'input>> {
    children(node, tag).find(|n| n.attribute("name") == Some(name))
}

fn text_u64(node: Option<Node>) -> u64 {
    node.and_then(|n| n.text())
        .and_then(|t| t.trim().parse::<u64>().ok())
        .unwrap_or(0)
}

/// Physical lane count from `<run_dir>/RunInfo.xml`.
///
/// # Returns
/// `FlowcellLayout/@LaneCount`, or 1 when the file is missing or unreadable.
pub fn lane_count(run_dir: &Path) -> u32 {
    let path = run_dir.join(RUN_INFO);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            debug!("No {} ({}), assuming a single lane", path.display(), e);
            return 1;
        }
    };
    let Ok(doc) = Document::parse(&text) else {
        warn!("Unparseable {}, assuming a single lane", path.display());
        return 1;
    };
    doc.descendants()
        .find(|n| n.has_tag_name("FlowcellLayout"))
        .and_then(|n| n.attribute("LaneCount"))
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(1)
}

/// Read geometry such as `2x151`, counting only non-index reads.
///
/// Mixed read lengths are listed individually, e.g. `1x26,1x98`.
pub fn read_geometry(run_dir: &Path) -> Option<String> {
    let text = fs::read_to_string(run_dir.join(RUN_INFO)).ok()?;
    let doc = Document::parse(&text).ok()?;
    let lengths: Vec<u32> = doc
        .descendants()
        .filter(|n| n.has_tag_name("Read"))
        .filter(|n| n.attribute("IsIndexedRead") != Some("Y"))
        .filter_map(|n| n.attribute("NumCycles")?.parse::<u32>().ok())
        .collect();
    if lengths.is_empty() {
        return None;
    }
    if lengths.iter().all(|l| *l == lengths[0]) {
        return Some(format!("{}x{}", lengths.len(), lengths[0]));
    }
    Some(lengths.iter().map(|l| format!("1x{}", l)).collect::<Vec<_>>().join(","))
}

/// Undetermined and total read counts for one lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneCounts {
    pub undetermined: u64,
    pub total: u64,
}

/// Adds the `Project/Sample "all"/Barcode/Lane/BarcodeCount` values of one
/// project into `target`.
fn sum_barcode_counts(flowcell: Node, project: &str, target: &mut BTreeMap<u32, LaneCounts>, undetermined: bool) {
    let Some(barcode) = named(flowcell, "Project", project)
        .and_then(|p| named(p, "Sample", "all"))
        .and_then(|s| child(s, "Barcode"))
    else {
        return;
    };
    for lane in children(barcode, "Lane") {
        let Some(number) = lane.attribute("number").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let count = text_u64(child(lane, "BarcodeCount"));
        let entry = target.entry(number).or_default();
        if undetermined {
            entry.undetermined += count;
        } else {
            entry.total += count;
        }
    }
}

fn parse_demux_xml(text: &str, counts: &mut BTreeMap<u32, LaneCounts>) -> Result<()> {
    let doc = Document::parse(text)?;
    let flowcell = doc
        .root_element()
        .children()
        .find(|n| n.is_element())
        .ok_or_else(|| anyhow!("No flowcell element"))?;
    sum_barcode_counts(flowcell, "default", counts, true);
    sum_barcode_counts(flowcell, "all", counts, false);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StatsJson {
    #[serde(rename = "ConversionResults", default)]
    conversion_results: Vec<ConversionResult>,
}

#[derive(Debug, Deserialize)]
struct ConversionResult {
    #[serde(rename = "LaneNumber")]
    lane_number: u32,
    #[serde(rename = "TotalClustersPF", default)]
    total_clusters_pf: u64,
    #[serde(rename = "Undetermined")]
    undetermined: Option<UndeterminedReads>,
}

#[derive(Debug, Deserialize)]
struct UndeterminedReads {
    #[serde(rename = "NumberReads", default)]
    number_reads: u64,
}

fn parse_stats_json(text: &str, counts: &mut BTreeMap<u32, LaneCounts>) -> Result<()> {
    let stats: StatsJson = serde_json::from_str(text)?;
    for result in stats.conversion_results {
        let entry = counts.entry(result.lane_number).or_default();
        entry.total += result.total_clusters_pf;
        entry.undetermined += result.undetermined.map(|u| u.number_reads).unwrap_or(0);
    }
    Ok(())
}

/// Stats files of every demultiplexing part: `Stats/<file>` plus
/// `Stats/*/<file>` when bcl2fastq ran once per sub-manifest.
fn part_files(stats_dir: &Path, file: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let top = stats_dir.join(file);
    if top.exists() {
        files.push(top);
    }
    files.extend(glob_under(stats_dir, &format!("*/{}", file))?);
    Ok(files)
}

/// Per-lane undetermined-index counts, summed over all demultiplexing parts.
/// Falls back to `Stats.json` when no `DemultiplexingStats.xml` is usable.
pub fn undetermined_per_lane(stats_dir: &Path) -> Result<BTreeMap<u32, LaneCounts>> {
    let mut counts = BTreeMap::new();
    for path in part_files(stats_dir, DEMUX_STATS_XML)? {
        let text = fs::read_to_string(&path)?;
        if let Err(e) = parse_demux_xml(&text, &mut counts) {
            warn!("Skipping {}: {}", path.display(), e);
        }
    }
    if counts.values().any(|c| c.total > 0) {
        return Ok(counts);
    }

    counts.clear();
    for path in part_files(stats_dir, STATS_JSON)? {
        let text = fs::read_to_string(&path)?;
        if let Err(e) = parse_stats_json(&text, &mut counts) {
            warn!("Skipping {}: {}", path.display(), e);
        }
    }
    Ok(counts)
}

/// One line per lane with reads, each starting with a newline.
pub fn format_undetermined(counts: &BTreeMap<u32, LaneCounts>) -> String {
    let mut out = String::new();
    for (lane, c) in counts {
        if c.total == 0 {
            continue;
        }
        out.push_str(&format!(
            "\nLane {}: {} of {} reads/pairs had undetermined indices ({:5.2}%)",
            lane,
            c.undetermined,
            c.total,
            100.0 * c.undetermined as f64 / c.total as f64
        ));
    }
    out
}

#[derive(Debug, Clone, Copy, Default)]
struct ReadTotals {
    yield_bases: u64,
    yield_q30: u64,
    quality_sum: u64,
}

#[derive(Debug, Clone, Default)]
struct LaneMetrics {
    clusters_raw: u64,
    clusters_pf: u64,
    reads: BTreeMap<u32, ReadTotals>,
}

fn percent(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| 100.0 * numerator as f64 / denominator as f64)
}

fn parse_conversion_xml(text: &str, lanes: &mut BTreeMap<u32, LaneMetrics>) -> Result<()> {
    let doc = Document::parse(text)?;
    let flowcell = doc
        .root_element()
        .children()
        .find(|n| n.is_element())
        .ok_or_else(|| anyhow!("No flowcell element"))?;
    let barcode = named(flowcell, "Project", "all")
        .and_then(|p| named(p, "Sample", "all"))
        .and_then(|s| child(s, "Barcode"))
        .ok_or_else(|| anyhow!("No Project \"all\" summary"))?;

    for lane in children(barcode, "Lane") {
        let Some(number) = lane.attribute("number").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let metrics = lanes.entry(number).or_default();
        for tile in children(lane, "Tile") {
            metrics.clusters_raw += text_u64(child(tile, "Raw").and_then(|r| child(r, "ClusterCount")));
            let Some(pf) = child(tile, "Pf") else { continue };
            metrics.clusters_pf += text_u64(child(pf, "ClusterCount"));
            for read in children(pf, "Read") {
                let read_number = read.attribute("number").and_then(|n| n.parse::<u32>().ok()).unwrap_or(1);
                let totals = metrics.reads.entry(read_number).or_default();
                totals.yield_bases += text_u64(child(read, "Yield"));
                totals.yield_q30 += text_u64(child(read, "YieldQ30"));
                totals.quality_sum += text_u64(child(read, "QualityScoreSum"));
            }
        }
    }
    Ok(())
}

/// Per-lane flow cell metrics table from `ConversionStats.xml`, summed over
/// all demultiplexing parts: clusters (% passing filter), % bases >= Q30 and
/// mean base quality per read.
///
/// # Returns
/// None when no part has a readable file.
pub fn conversion_metrics(stats_dir: &Path) -> Option<String> {
    let paths = match part_files(stats_dir, CONVERSION_STATS_XML) {
        Ok(paths) => paths,
        Err(e) => {
            warn!("Unable to list {} files: {}", CONVERSION_STATS_XML, e);
            return None;
        }
    };
    let mut lanes: BTreeMap<u32, LaneMetrics> = BTreeMap::new();
    for path in paths {
        let Ok(text) = fs::read_to_string(&path) else { continue };
        if let Err(e) = parse_conversion_xml(&text, &mut lanes) {
            warn!("Unable to parse {}: {}", path.display(), e);
        }
    }
    if lanes.is_empty() {
        return None;
    }

    let mut out = String::from("Lane\t# Clusters (% pass)\t% Bases >=Q30\tAve. base qual.\n");
    for (lane, m) in &lanes {
        out.push_str(&format!("Lane {}", lane));
        match percent(m.clusters_pf, m.clusters_raw) {
            Some(p) => out.push_str(&format!("\t{} ({:5.2}%)", m.clusters_raw, p)),
            None => out.push_str(&format!("\t{} (NA)", m.clusters_raw)),
        }
        let q30: Vec<String> = m
            .reads
            .values()
            .map(|r| percent(r.yield_q30, r.yield_bases).map_or("NA".to_string(), |p| format!("{:5.2}%", p)))
            .collect();
        let quality: Vec<String> = m
            .reads
            .values()
            .map(|r| {
                if r.yield_bases > 0 {
                    format!("{:4.1}", r.quality_sum as f64 / r.yield_bases as f64)
                } else {
                    "NA".to_string()
                }
            })
            .collect();
        out.push_str(&format!("\t{}\t{}\n", q30.join("/"), quality.join("/")));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RUN_INFO_XML: &str = r#"<?xml version="1.0"?>
<RunInfo Version="2">
  <Run Id="150416_SN7001334_0196_BC605HACXX" Number="196">
    <Reads>
      <Read Number="1" NumCycles="51" IsIndexedRead="N" />
      <Read Number="2" NumCycles="8" IsIndexedRead="Y" />
      <Read Number="3" NumCycles="51" IsIndexedRead="N" />
    </Reads>
    <FlowcellLayout LaneCount="8" SurfaceCount="2" SwathCount="2" TileCount="16" />
  </Run>
</RunInfo>"#;

    fn demux_xml(undetermined: [(u32, u64); 2], totals: [(u32, u64); 2]) -> String {
        let lanes = |v: [(u32, u64); 2]| {
            v.iter()
                .map(|(l, c)| format!("<Lane number=\"{}\"><BarcodeCount>{}</BarcodeCount><PerfectBarcodeCount>0</PerfectBarcodeCount></Lane>", l, c))
                .collect::<String>()
        };
        format!(
            "<Stats><Flowcell flowcell-id=\"C605HACXX\">\
             <Project name=\"GCF-0001\"><Sample name=\"all\"><Barcode name=\"all\"></Barcode></Sample></Project>\
             <Project name=\"default\"><Sample name=\"all\"><Barcode name=\"all\">{}</Barcode></Sample></Project>\
             <Project name=\"all\"><Sample name=\"all\"><Barcode name=\"all\">{}</Barcode></Sample></Project>\
             </Flowcell></Stats>",
            lanes(undetermined),
            lanes(totals)
        )
    }

    #[test]
    fn test_run_info() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(lane_count(dir.path()), 1);
        assert_eq!(read_geometry(dir.path()), None);
        fs::write(dir.path().join(RUN_INFO), RUN_INFO_XML)?;
        assert_eq!(lane_count(dir.path()), 8);
        assert_eq!(read_geometry(dir.path()).as_deref(), Some("2x51"));
        Ok(())
    }

    #[test]
    fn test_undetermined_summed_over_parts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let stats = dir.path().join("Stats");
        fs::create_dir_all(stats.join("part1"))?;
        fs::create_dir_all(stats.join("part2"))?;
        fs::write(stats.join("part1").join(DEMUX_STATS_XML), demux_xml([(1, 10), (2, 5)], [(1, 100), (2, 50)]))?;
        fs::write(stats.join("part2").join(DEMUX_STATS_XML), demux_xml([(1, 10), (3, 0)], [(1, 100), (3, 20)]))?;

        let counts = undetermined_per_lane(&stats)?;
        assert_eq!(counts[&1], LaneCounts { undetermined: 20, total: 200 });
        assert_eq!(counts[&2], LaneCounts { undetermined: 5, total: 50 });

        let message = format_undetermined(&counts);
        assert!(message.contains("\nLane 1: 20 of 200 reads/pairs had undetermined indices (10.00%)"));
        assert!(message.contains("\nLane 3: 0 of 20 reads/pairs had undetermined indices ( 0.00%)"));
        Ok(())
    }

    #[test]
    fn test_undetermined_falls_back_to_stats_json() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(STATS_JSON),
            r#"{"Flowcell":"X","ConversionResults":[
                {"LaneNumber":1,"TotalClustersPF":400,"Undetermined":{"NumberReads":40}},
                {"LaneNumber":2,"TotalClustersPF":0}]}"#,
        )?;
        let counts = undetermined_per_lane(dir.path())?;
        assert_eq!(counts[&1], LaneCounts { undetermined: 40, total: 400 });
        assert_eq!(format_undetermined(&counts), "\nLane 1: 40 of 400 reads/pairs had undetermined indices (10.00%)");
        Ok(())
    }

    #[test]
    fn test_conversion_metrics() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(conversion_metrics(dir.path()).is_none());
        let tile = |raw: u64, pf: u64| {
            format!(
                "<Tile number=\"1101\"><Raw><ClusterCount>{raw}</ClusterCount></Raw><Pf><ClusterCount>{pf}</ClusterCount>\
                 <Read number=\"1\"><Yield>1000</Yield><YieldQ30>900</YieldQ30><QualityScoreSum>35000</QualityScoreSum></Read>\
                 <Read number=\"2\"><Yield>1000</Yield><YieldQ30>800</YieldQ30><QualityScoreSum>30000</QualityScoreSum></Read>\
                 </Pf></Tile>"
            )
        };
        let xml = format!(
            "<Stats><Flowcell flowcell-id=\"X\"><Project name=\"all\"><Sample name=\"all\"><Barcode name=\"all\">\
             <Lane number=\"1\">{}{}</Lane></Barcode></Sample></Project></Flowcell></Stats>",
            tile(100, 80),
            tile(100, 70)
        );
        fs::write(dir.path().join(CONVERSION_STATS_XML), xml)?;
        let table = conversion_metrics(dir.path()).unwrap_or_default();
        let lane = table.lines().nth(1).unwrap_or_default();
        assert_eq!(lane, "Lane 1\t200 (75.00%)\t90.00%/80.00%\t35.0/30.0");
        Ok(())
    }

    #[test]
    fn test_conversion_metrics_merged_over_parts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lane = |number: u32, raw: u64, pf: u64| {
            format!(
                "<Lane number=\"{number}\"><Tile number=\"1101\"><Raw><ClusterCount>{raw}</ClusterCount></Raw>\
                 <Pf><ClusterCount>{pf}</ClusterCount><Read number=\"1\"><Yield>1000</Yield><YieldQ30>500</YieldQ30>\
                 <QualityScoreSum>30000</QualityScoreSum></Read></Pf></Tile></Lane>"
            )
        };
        let xml = |lanes: String| {
            format!(
                "<Stats><Flowcell flowcell-id=\"X\"><Project name=\"all\"><Sample name=\"all\"><Barcode name=\"all\">\
                 {}</Barcode></Sample></Project></Flowcell></Stats>",
                lanes
            )
        };
        for part in ["part1", "part2"] {
            fs::create_dir_all(dir.path().join(part))?;
        }
        fs::write(dir.path().join("part1").join(CONVERSION_STATS_XML), xml(lane(1, 100, 50)))?;
        fs::write(
            dir.path().join("part2").join(CONVERSION_STATS_XML),
            xml(format!("{}{}", lane(1, 100, 100), lane(2, 10, 10))),
        )?;

        let table = conversion_metrics(dir.path()).unwrap_or_default();
        let rows: Vec<&str> = table.lines().skip(1).collect();
        assert_eq!(rows, vec!["Lane 1\t200 (75.00%)\t50.00%\t30.0", "Lane 2\t10 (100.00%)\t50.00%\t30.0"]);
        Ok(())
    }
}
