use approx::assert_relative_eq;
use ndarray::Array2;
use peakfinder::core::{aligned_dtm_path, Pipeline, RunConfig, SubsetMode};
use peakfinder::{CornerPoint, GeoTiff, GeoTransform, HeightRaster, LocalStem, MatchClass};
use std::path::{Path, PathBuf};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// 40 x 60 nDSM, 1 m pixels; pixel (r, c) centre = (1000.5 + c, 2039.5 - r).
/// Cone of 25 m at (20, 15) and cone of 22 m at (20, 45), slope 2 m/m.
fn cones() -> Array2<f64> {
    Array2::from_shape_fn((40, 60), |(r, c)| {
        let cone = |cr: f64, cc: f64, h: f64| {
            let d = ((r as f64 - cr).powi(2) + (c as f64 - cc).powi(2)).sqrt();
            (h - 2.0 * d).max(0.0)
        };
        cone(20.0, 15.0, 25.0).max(cone(20.0, 45.0, 22.0))
    })
}

fn ndsm() -> HeightRaster {
    HeightRaster::new(
        cones(),
        GeoTransform::north_up(1000.0, 2040.0, 1.0),
        Some(-9999.0),
        String::new(),
    )
}

fn corners() -> Vec<CornerPoint> {
    vec![
        CornerPoint { plot: 1, id: 10001, x: 1000.0, y: 2000.0 },
        CornerPoint { plot: 1, id: 10002, x: 1060.0, y: 2000.0 },
        CornerPoint { plot: 1, id: 10003, x: 1000.0, y: 2040.0 },
        // single-corner plot: its stems are dropped
        CornerPoint { plot: 2, id: 10001, x: 1000.0, y: 2000.0 },
    ]
}

fn stems() -> Vec<LocalStem> {
    let s = |plot, id, x, y| LocalStem { plot, id, x, y, z: 0.0 };
    vec![
        s(1, 1004, 100.0, 5.0), // outside the raster
        s(1, 1001, 15.6, 20.3), // alone under the first crown
        s(1, 1002, 44.0, 20.5), // shares the second crown
        s(1, 1003, 47.0, 18.0), // shares the second crown, too far for the assignment
        s(2, 2001, 1.0, 1.0),
    ]
}

fn config() -> RunConfig {
    RunConfig {
        neighborhood_size: 5,
        min_height_threshold: 10.0,
        sigma: 0.0,
        max_distance: 2.0,
        radius_unmatched: 5.0,
        subset: SubsetMode::Full,
        ground_threshold: 5.0,
        sigma_for_treetops: 1.0,
        sigma_for_segmentation: 0.5,
        min_distance: 3,
        threshold_abs: Some(5.0),
        min_area_threshold: 10,
        ..RunConfig::default()
    }
}

#[test]
fn test_full_run_in_memory() {
    init_logging();
    let result = Pipeline::new(config()).unwrap().process(&ndsm(), &corners(), &stems()).unwrap();

    assert_eq!(result.treetops.len(), 2);
    assert_eq!(result.stems.len(), 4);

    let ids: Vec<(i64, i64)> = result.rows.iter().map(|r| (r.plot, r.id)).collect();
    assert_eq!(ids, vec![(1, 1001), (1, 1002), (1, 1003), (1, 1004)]);

    let a = &result.rows[0];
    assert_eq!(a.class, MatchClass::Matched);
    assert_relative_eq!(a.height_segment.unwrap(), 25.0);
    assert_relative_eq!(a.height_pixel.unwrap(), 25.0);
    assert_eq!((a.treetop_x, a.treetop_y), (Some(1015.5), Some(2019.5)));

    let b = &result.rows[1];
    assert_eq!(b.class, MatchClass::Unmatched);
    assert_eq!(b.height_segment, None);
    assert_relative_eq!(b.height_pixel.unwrap(), 22.0);

    let c = &result.rows[2];
    assert_eq!(c.class, MatchClass::Unmatched);
    assert_eq!(c.height_pixel, None);

    let d = &result.rows[3];
    assert_eq!(d.class, MatchClass::NoRegion);
    assert_eq!(d.height_pixel, None);

    let stats = &result.stats;
    assert_eq!((stats.segments, stats.peaks), (2, 2));
    assert_eq!((stats.point_matched, stats.point_unmatched, stats.point_rescued), (2, 2, 0));
    assert_eq!(
        (stats.segment_matched, stats.segment_unmatched, stats.segment_no_region),
        (1, 2, 1)
    );

    let summary = result.height_summary.unwrap();
    assert_eq!(summary.count, 1);
    assert_relative_eq!(summary.max, 25.0);
}

#[test]
fn test_labels_are_dense_and_off_ground() {
    init_logging();
    let raster = ndsm();
    let result = Pipeline::new(config()).unwrap().process(&raster, &corners(), &stems()).unwrap();
    let seg = result.segmentation.unwrap();

    let max = seg.labels.iter().copied().max().unwrap_or(0);
    for id in 1..=max {
        assert!(seg.labels.iter().any(|&l| l == id), "label {} missing", id);
    }
    for ((r, c), &l) in seg.labels.indexed_iter() {
        if raster.data[[r, c]] <= 5.0 {
            assert_eq!(l, 0);
        }
    }
}

#[test]
fn test_segmentation_disabled_keeps_point_heights() {
    init_logging();
    let cfg = RunConfig {
        use_segmentation: false,
        ..config()
    };
    let result = Pipeline::new(cfg).unwrap().process(&ndsm(), &corners(), &stems()).unwrap();
    assert!(result.segmentation.is_none());
    assert!(result.rows.iter().all(|r| r.class == MatchClass::NoRegion));
    assert!(result.rows.iter().all(|r| r.height_segment.is_none()));
    assert_eq!(result.rows.iter().filter(|r| r.height_pixel.is_some()).count(), 2);
}

#[test]
fn test_center_subset_uses_window_transform() {
    init_logging();
    // 20 m window centred on the raster: rows 10..30, cols 20..40; the first crown is cut off
    let cfg = RunConfig {
        subset: SubsetMode::Center { size_m: 20.0 },
        ..config()
    };
    let result = Pipeline::new(cfg).unwrap().process(&ndsm(), &corners(), &stems()).unwrap();
    let seg = result.segmentation.unwrap();
    assert_eq!(seg.labels.dim(), (20, 20));
    assert_eq!(seg.raster.transform.pixel_center(0, 0), (1020.5, 2029.5));

    // stem 1001 sits at column 15, outside the window
    let a = result.rows.iter().find(|r| r.id == 1001).unwrap();
    assert_eq!(a.class, MatchClass::NoRegion);
}

/// Surface model (nDSM + 100 m) and a 2 m terrain model of 100 m over the same extent.
fn write_surface_and_terrain(dir: &Path) -> (PathBuf, PathBuf) {
    let dsm_path = dir.join("dsm.tif");
    let dtm_path = dir.join("dtm.tif");
    let dsm = HeightRaster::new(
        cones().mapv(|h| h + 100.0),
        GeoTransform::north_up(1000.0, 2040.0, 1.0),
        Some(-9999.0),
        String::new(),
    );
    let dtm = HeightRaster::new(
        Array2::from_elem((20, 30), 100.0),
        GeoTransform::north_up(1000.0, 2040.0, 2.0),
        Some(-9999.0),
        String::new(),
    );
    GeoTiff::write_heights(&dsm, &dsm_path).unwrap();
    GeoTiff::write_heights(&dtm, &dtm_path).unwrap();
    (dsm_path, dtm_path)
}

fn write_field_csvs(dir: &Path) -> (PathBuf, PathBuf) {
    let corners_path = dir.join("corners.csv");
    let stems_path = dir.join("stems.csv");
    let mut corners_csv = String::from("plot,id,x,y\n");
    for c in corners() {
        corners_csv.push_str(&format!("{},{},{},{}\n", c.plot, c.id, c.x, c.y));
    }
    std::fs::write(&corners_path, corners_csv).unwrap();
    let mut stems_csv = String::from("plot,id,x,y,z\n");
    for s in stems() {
        stems_csv.push_str(&format!("{},{},{},{},{}\n", s.plot, s.id, s.x, s.y, s.z));
    }
    std::fs::write(&stems_path, stems_csv).unwrap();
    (corners_path, stems_path)
}

#[test]
fn test_removed_crown_gives_no_region() {
    init_logging();
    // the 22 m crown covers about 225 cells, the 25 m one about 305
    let cfg = RunConfig {
        min_area_threshold: 270,
        ..config()
    };
    let result = Pipeline::new(cfg).unwrap().process(&ndsm(), &corners(), &stems()).unwrap();
    let seg = result.segmentation.as_ref().unwrap();
    assert_eq!(seg.segment_count, 1);
    assert_eq!(seg.labels[[20, 45]], 0);
    assert_eq!(result.unmatched_peaks, vec![(20, 45)]);

    let classes: Vec<MatchClass> = result.rows.iter().map(|r| r.class).collect();
    assert_eq!(
        classes,
        vec![MatchClass::Matched, MatchClass::NoRegion, MatchClass::NoRegion, MatchClass::NoRegion]
    );
    assert!(result.rows[1..].iter().all(|r| r.height_segment.is_none()));
    // the point height of the stem in the removed crown survives
    assert_relative_eq!(result.rows[1].height_pixel.unwrap(), 22.0);
}

#[test]
fn test_file_based_run_with_local_terrain() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (dsm_path, dtm_path) = write_surface_and_terrain(dir.path());
    let (corners_path, stems_path) = write_field_csvs(dir.path());
    let ndsm_path = dir.path().join("out").join("ndsm.tif");
    let output_csv = dir.path().join("out").join("results.csv");
    let labels_tif = dir.path().join("out").join("labels.tif");
    let summary_json = dir.path().join("summary.json");

    let cfg = RunConfig {
        dsm_path: Some(dsm_path),
        dtm_path: Some(dtm_path),
        ndsm_path: Some(ndsm_path.clone()),
        compute_ndsm: true,
        download_dtm: false,
        corners_csv: Some(corners_path),
        stems_csv: Some(stems_path),
        output_csv: Some(output_csv.clone()),
        labels_tif: Some(labels_tif.clone()),
        summary_json: Some(summary_json.clone()),
        ..config()
    };
    let result = Pipeline::new(cfg).unwrap().run().unwrap();
    assert_eq!(result.rows.len(), 4);
    assert_eq!(result.rows[0].class, MatchClass::Matched);

    let written = GeoTiff::read(&ndsm_path).unwrap();
    assert_eq!(written.shape(), (40, 60));
    assert_relative_eq!(written.data[[20, 15]], 25.0, epsilon = 1e-4);

    let table = std::fs::read_to_string(&output_csv).unwrap();
    let mut lines = table.lines();
    assert_eq!(
        lines.next(),
        Some("Parzelle,Nr,Stem_UTM_X,Stem_UTM_Y,Treetop_UTM_X,Treetop_UTM_Y,UAV_Tree_Height_segment,UAV_Tree_Height_pixel,match")
    );
    assert_eq!(lines.count(), 4);

    let labels = GeoTiff::read(&labels_tif).unwrap();
    assert_eq!(labels.data[[20, 15]], 1.0);
    assert_eq!(labels.data[[20, 45]], 2.0);
    assert_eq!(labels.data[[0, 0]], 0.0);

    let summary: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&summary_json).unwrap()).unwrap();
    assert_eq!(summary["stats"]["segment_matched"], 1);

    // no staging leftovers
    assert!(!dir.path().join("out").join("results.partial.csv").exists());
    assert!(!dir.path().join("out").join("labels.partial.tif").exists());
}

#[test]
fn test_ndsm_only_needs_no_field_data() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let (dsm_path, dtm_path) = write_surface_and_terrain(dir.path());
    let ndsm_path = dir.path().join("ndsm.tif");

    let cfg = RunConfig {
        dsm_path: Some(dsm_path),
        dtm_path: Some(dtm_path.clone()),
        ndsm_path: Some(ndsm_path.clone()),
        ndsm_only: true,
        download_dtm: false,
        ..config()
    };
    let ndsm = Pipeline::new(cfg).unwrap().run_ndsm_only().unwrap();
    assert_eq!(ndsm.shape(), (40, 60));
    assert_relative_eq!(ndsm.data[[20, 45]], 22.0, epsilon = 1e-4);

    let aligned = GeoTiff::read(aligned_dtm_path(&dtm_path)).unwrap();
    assert_eq!(aligned_dtm_path(&dtm_path), dir.path().join("dtm_aligned_to_DSM.tif"));
    assert_eq!(aligned.shape(), (40, 60));
    assert_eq!(aligned.transform, GeoTransform::north_up(1000.0, 2040.0, 1.0));
    assert!(aligned.data.iter().all(|&v| (v - 100.0).abs() < 1e-6));

    assert_eq!(GeoTiff::read(&ndsm_path).unwrap().shape(), (40, 60));
}

#[test]
fn test_failed_output_leaves_no_result_table() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let ndsm_path = dir.path().join("ndsm.tif");
    GeoTiff::write_heights(&ndsm(), &ndsm_path).unwrap();
    let (corners_path, stems_path) = write_field_csvs(dir.path());

    // a plain file where the label directory should be
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, "not a directory").unwrap();
    let output_csv = dir.path().join("out").join("results.csv");

    let cfg = RunConfig {
        ndsm_path: Some(ndsm_path),
        corners_csv: Some(corners_path),
        stems_csv: Some(stems_path),
        output_csv: Some(output_csv.clone()),
        labels_tif: Some(blocker.join("labels.tif")),
        summary_json: Some(dir.path().join("summary.json")),
        ..config()
    };
    assert!(Pipeline::new(cfg).unwrap().run().is_err());
    assert!(!output_csv.exists());
    assert!(!dir.path().join("out").join("results.partial.csv").exists());
    assert!(!dir.path().join("summary.json").exists());
}
