//! End-to-end pipeline scenarios over on-disk fixtures.

use std::path::Path;
use std::sync::Arc;

use stratus::algorithm::{Request, keys};
use stratus::array::{ElementType, VariantArray};
use stratus::comm::{Communicator, SelfCommunicator, block_partition};
use stratus::dataset::Dataset;
use stratus::error::Result;
use stratus::executive::IndexExecutive;
use stratus::io::native::NativeDriver;
use stratus::io::{FormatDriver, FormatFileWriter, VariableInfo};
use stratus::metadata::Metadata;
use stratus::pipeline::{Pipeline, PortHandle};
use stratus::stages;
use stratus::stream::BinaryStream;

/// Writes a (time, lat, lon) container with the given fields.
fn write_input(
    path: &Path,
    time: &[f64],
    units: Option<&str>,
    calendar: Option<&str>,
    lat: &[f64],
    lon: &[f64],
    fields: &[(&str, Vec<f64>)],
) {
    let driver = NativeDriver;
    let mut writer = driver.create(path).unwrap();
    writer.define_dimension("time", time.len() as u64, true).unwrap();
    writer.define_dimension("lat", lat.len() as u64, false).unwrap();
    writer.define_dimension("lon", lon.len() as u64, false).unwrap();

    let mut time_atts = Metadata::new();
    if let Some(units) = units {
        time_atts.set_string("units", units);
    }
    if let Some(calendar) = calendar {
        time_atts.set_string("calendar", calendar);
    }
    for (name, dims, atts) in [
        ("time", vec!["time".to_string()], time_atts),
        ("lat", vec!["lat".to_string()], Metadata::new()),
        ("lon", vec!["lon".to_string()], Metadata::new()),
    ] {
        writer
            .define_variable(VariableInfo {
                name: name.to_string(),
                dimensions: dims,
                element_type: ElementType::Float64,
                attributes: atts,
            })
            .unwrap();
    }
    for (name, _) in fields {
        writer
            .define_variable(VariableInfo {
                name: name.to_string(),
                dimensions: vec!["time".to_string(), "lat".to_string(), "lon".to_string()],
                element_type: ElementType::Float64,
                attributes: Metadata::new(),
            })
            .unwrap();
    }

    writer.write("time", &VariantArray::from(time.to_vec())).unwrap();
    writer.write("lat", &VariantArray::from(lat.to_vec())).unwrap();
    writer.write("lon", &VariantArray::from(lon.to_vec())).unwrap();
    for (name, values) in fields {
        writer.write(name, &VariantArray::from(values.clone())).unwrap();
    }
    writer.close().unwrap();
}

fn source_over(files: Vec<String>) -> (Pipeline, usize) {
    let mut pipeline = Pipeline::new();
    let source = pipeline.add_stage(stages::create_stage("source").unwrap());
    pipeline
        .set_property(source, "files", files.into())
        .unwrap();
    (pipeline, source)
}

fn request_for(step: u64, arrays: &[&str]) -> Request {
    let mut request = Request::new();
    request.set_u64("time_step", step);
    request.set_strings(keys::ARRAYS, arrays.iter().map(|a| a.to_string()).collect());
    request
}

fn serialize(dataset: &Dataset) -> Vec<u8> {
    let mut stream = BinaryStream::new();
    dataset.to_stream(&mut stream);
    stream.into_bytes()
}

/// A fixed-rank view used to exercise the block partition; collectives
/// are identities because each rank runs in its own test process space.
struct RankView {
    rank: usize,
    size: usize,
}

impl Communicator for RankView {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, _root: usize, _bytes: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn gather(&self, _root: usize, bytes: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        Ok(Some(vec![bytes.to_vec()]))
    }
}

#[tokio::test]
async fn s1_reader_returns_the_requested_time_slice() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfb");
    // T[t, j, i] = 100 t + 10 j + i on a 2 x 2 grid, three steps.
    let values: Vec<f64> = (0..3)
        .flat_map(|t| (0..2).flat_map(move |j| (0..2).map(move |i| (100 * t + 10 * j + i) as f64)))
        .collect();
    write_input(
        &path,
        &[0.0, 1.0, 2.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0, 10.0],
        &[0.0, 10.0],
        &[("T", values)],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    pipeline.update_metadata().await.unwrap();
    let dataset = pipeline
        .pull(PortHandle::new(source, 0), &request_for(1, &["T"]))
        .await
        .unwrap();

    let mesh = dataset.as_mesh().unwrap();
    assert_eq!(mesh.time(), 1.0);
    assert_eq!(mesh.time_step(), 1);
    let t = mesh.point_arrays.get("T").unwrap();
    assert_eq!(t.as_f64s().unwrap(), &[100.0, 101.0, 110.0, 111.0]);
}

#[tokio::test]
async fn s2_time_axes_convert_onto_the_first_files_units() {
    let dir = tempfile::tempdir().unwrap();
    let grid = vec![0.0f64; 1];
    let a = dir.path().join("a.cfb");
    let b = dir.path().join("b.cfb");
    write_input(
        &a,
        &[0.0, 1.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0],
        &[0.0],
        &[("T", vec![grid[0]; 2])],
    );
    write_input(
        &b,
        &[48.0, 72.0],
        Some("hours since 2000-01-01"),
        Some("standard"),
        &[0.0],
        &[0.0],
        &[("T", vec![grid[0]; 2])],
    );

    let (mut pipeline, source) = source_over(vec![
        a.to_string_lossy().into_owned(),
        b.to_string_lossy().into_owned(),
    ]);
    pipeline.update_metadata().await.unwrap();
    let report = pipeline
        .output_metadata(PortHandle::new(source, 0))
        .unwrap();

    let coordinates = report.get_nested(keys::COORDINATES).unwrap();
    let time = coordinates.get_f64s(keys::T).unwrap();
    assert_eq!(time, vec![0.0, 1.0, 2.0, 3.0]);
    assert_eq!(report.get_u64(keys::NUMBER_OF_TIME_STEPS), Some(4));
    assert_eq!(report.get_u64s(keys::STEP_COUNT).unwrap(), vec![2, 2]);
}

#[tokio::test]
async fn s2_calendar_mismatch_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.cfb");
    let b = dir.path().join("b.cfb");
    write_input(
        &a,
        &[0.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0],
        &[0.0],
        &[("T", vec![0.0])],
    );
    write_input(
        &b,
        &[1.0],
        Some("days since 2000-01-01"),
        Some("noleap"),
        &[0.0],
        &[0.0],
        &[("T", vec![0.0])],
    );

    let (mut pipeline, _source) = source_over(vec![
        a.to_string_lossy().into_owned(),
        b.to_string_lossy().into_owned(),
    ]);
    let err = pipeline.update_metadata().await.unwrap_err();
    assert!(err.to_string().contains("calendar"));
}

#[tokio::test]
async fn s3_uniform_wind_has_zero_interior_vorticity() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wind.cfb");
    write_input(
        &path,
        &[0.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[10.0, 0.0, -10.0],
        &[0.0, 10.0, 20.0],
        &[("u", vec![1.0; 9]), ("v", vec![1.0; 9])],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    let vorticity = pipeline.add_stage(stages::create_stage("vorticity").unwrap());
    pipeline
        .connect(PortHandle::new(source, 0), vorticity, 0)
        .unwrap();
    pipeline.update_metadata().await.unwrap();

    let dataset = pipeline
        .pull(PortHandle::new(vorticity, 0), &request_for(0, &["vorticity"]))
        .await
        .unwrap();
    let zeta = dataset
        .as_mesh()
        .unwrap()
        .point_arrays
        .get("vorticity")
        .unwrap();
    assert!(zeta.get_f64(4).unwrap().abs() < 1.0e-12);
}

#[tokio::test]
async fn s5_monthly_means_over_a_360_day_year() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daily.cfb");
    let time: Vec<f64> = (0..60).map(|i| i as f64).collect();
    let values: Vec<f64> = (0..60).map(|i| i as f64).collect();
    write_input(
        &path,
        &time,
        Some("days since 2000-01-01"),
        Some("360_day"),
        &[0.0],
        &[0.0],
        &[("T", values)],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    let reduction = pipeline.add_stage(stages::create_stage("temporal_reduction").unwrap());
    pipeline
        .connect(PortHandle::new(source, 0), reduction, 0)
        .unwrap();

    let mut executive = IndexExecutive::new(Arc::new(SelfCommunicator));
    executive.set_arrays(vec!["T".to_string()]);
    let outputs = pipeline
        .run(PortHandle::new(reduction, 0), &mut executive)
        .await
        .unwrap();

    assert_eq!(outputs.len(), 2);
    for (output, expected) in outputs.iter().zip([14.5f64, 44.5]) {
        let mesh = output.as_mesh().unwrap();
        let value = mesh.point_arrays.get("T").unwrap().get_f64(0).unwrap();
        assert!((value - expected).abs() < 1.0e-12);
    }
}

#[tokio::test]
async fn s6_date_range_resolution_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noleap.cfb");
    let time: Vec<f64> = (0..60).map(|i| i as f64).collect();
    write_input(
        &path,
        &time,
        Some("days since 2000-01-01"),
        Some("noleap"),
        &[0.0],
        &[0.0],
        &[("T", (0..60).map(|i| i as f64).collect())],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    pipeline.update_metadata().await.unwrap();
    let report = pipeline
        .output_metadata(PortHandle::new(source, 0))
        .unwrap()
        .clone();

    let mut executive = IndexExecutive::new(Arc::new(SelfCommunicator));
    executive.set_start_date("2000-02-01");
    executive.initialize(&report).unwrap();
    assert_eq!(
        executive.next_request().unwrap().get_u64("time_step"),
        Some(31)
    );

    let mut executive = IndexExecutive::new(Arc::new(SelfCommunicator));
    executive.set_end_date("2000-02-29");
    let err = executive.initialize(&report).unwrap_err();
    assert!(err.to_string().contains("out of range"));
}

#[tokio::test]
async fn user_supplied_time_values_replace_the_file_axes() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.cfb");
    let b = dir.path().join("b.cfb");
    for path in [&a, &b] {
        write_input(
            &path,
            &[0.0],
            Some("days since 1900-01-01"),
            Some("standard"),
            &[0.0],
            &[0.0],
            &[("T", vec![1.0])],
        );
    }

    let (mut pipeline, source) = source_over(vec![
        a.to_string_lossy().into_owned(),
        b.to_string_lossy().into_owned(),
    ]);
    pipeline
        .set_property(source, "t_values", serde_json::json!([10.0, 20.0]))
        .unwrap();
    pipeline
        .set_property(
            source,
            "t_units",
            serde_json::json!("days since 2000-01-01"),
        )
        .unwrap();
    pipeline
        .set_property(source, "calendar", serde_json::json!("noleap"))
        .unwrap();
    pipeline.update_metadata().await.unwrap();

    let report = pipeline
        .output_metadata(PortHandle::new(source, 0))
        .unwrap();
    let coordinates = report.get_nested(keys::COORDINATES).unwrap();
    assert_eq!(coordinates.get_f64s(keys::T).unwrap(), vec![10.0, 20.0]);
    assert_eq!(
        coordinates.get_string(keys::CALENDAR).as_deref(),
        Some("noleap")
    );
    assert_eq!(report.get_u64s(keys::STEP_COUNT).unwrap(), vec![1, 1]);
}

#[tokio::test]
async fn files_without_a_time_variable_get_a_synthetic_axis() {
    let dir = tempfile::tempdir().unwrap();
    let driver = NativeDriver;
    let mut paths = Vec::new();
    for (index, name) in ["p0.cfb", "p1.cfb"].iter().enumerate() {
        let path = dir.path().join(name);
        let mut writer = driver.create(&path).unwrap();
        writer.define_dimension("lat", 1, false).unwrap();
        writer.define_dimension("lon", 1, false).unwrap();
        for coord in ["lat", "lon"] {
            writer
                .define_variable(VariableInfo {
                    name: coord.to_string(),
                    dimensions: vec![coord.to_string()],
                    element_type: ElementType::Float64,
                    attributes: Metadata::new(),
                })
                .unwrap();
            writer
                .write(coord, &VariantArray::from(vec![0.0f64]))
                .unwrap();
        }
        writer
            .define_variable(VariableInfo {
                name: "T".to_string(),
                dimensions: vec!["lat".to_string(), "lon".to_string()],
                element_type: ElementType::Float64,
                attributes: Metadata::new(),
            })
            .unwrap();
        writer
            .write("T", &VariantArray::from(vec![index as f64]))
            .unwrap();
        writer.close().unwrap();
        paths.push(path.to_string_lossy().into_owned());
    }

    let (mut pipeline, source) = source_over(paths);
    pipeline.update_metadata().await.unwrap();
    let report = pipeline
        .output_metadata(PortHandle::new(source, 0))
        .unwrap();
    let coordinates = report.get_nested(keys::COORDINATES).unwrap();
    assert_eq!(coordinates.get_f64s(keys::T).unwrap(), vec![0.0, 1.0]);
    // A synthetic axis has no units to resolve dates against.
    assert!(!coordinates.has(keys::T_UNITS));

    let dataset = pipeline
        .pull(PortHandle::new(source, 0), &request_for(1, &["T"]))
        .await
        .unwrap();
    let mesh = dataset.as_mesh().unwrap();
    assert_eq!(mesh.point_arrays.get("T").unwrap().get_f64(0), Some(1.0));
}

#[tokio::test]
async fn reader_cache_survives_input_deletion() {
    let data = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let path = data.path().join("t.cfb");
    write_input(
        &path,
        &[0.0, 1.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0],
        &[0.0],
        &[("T", vec![0.0, 1.0])],
    );
    let files = vec![path.to_string_lossy().into_owned()];

    let scan = |files: Vec<String>| {
        let (mut pipeline, source) = source_over(files);
        pipeline
            .set_property(
                source,
                "metadata_cache_dir",
                cache_dir.path().to_string_lossy().into_owned().into(),
            )
            .unwrap();
        (pipeline, source)
    };

    let (mut first, source) = scan(files.clone());
    first.update_metadata().await.unwrap();
    let first_report = first
        .output_metadata(PortHandle::new(source, 0))
        .unwrap()
        .clone();

    let cached: Vec<_> = std::fs::read_dir(cache_dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(cached.len(), 1);
    let cache_bytes = std::fs::read(cached[0].path()).unwrap();

    // With the inputs gone only the cache can answer the second scan.
    std::fs::remove_file(&path).unwrap();
    let (mut second, source) = scan(files);
    second.update_metadata().await.unwrap();
    let second_report = second
        .output_metadata(PortHandle::new(source, 0))
        .unwrap()
        .clone();

    assert_eq!(first_report, second_report);
    assert_eq!(std::fs::read(cached[0].path()).unwrap(), cache_bytes);
}

#[tokio::test]
async fn rank_partitions_reproduce_the_single_rank_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfb");
    let time: Vec<f64> = (0..5).map(|i| i as f64).collect();
    let values: Vec<f64> = (0..5).flat_map(|t| (0..4).map(move |c| (10 * t + c) as f64)).collect();
    write_input(
        &path,
        &time,
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0, 10.0],
        &[0.0, 10.0],
        &[("T", values)],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    pipeline.update_metadata().await.unwrap();
    let report = pipeline
        .output_metadata(PortHandle::new(source, 0))
        .unwrap()
        .clone();

    // Reference: every index on one rank.
    let mut reference = Vec::new();
    let mut single = IndexExecutive::new(Arc::new(SelfCommunicator));
    single.set_arrays(vec!["T".to_string()]);
    single.initialize(&report).unwrap();
    while let Some(request) = single.next_request() {
        let dataset = pipeline.pull(PortHandle::new(source, 0), &request).await.unwrap();
        reference.push(serialize(&dataset));
    }
    assert_eq!(reference.len(), 5);

    // The same pipeline driven by each rank of a 2-way partition.
    let size = 2;
    let mut seen = 0;
    for rank in 0..size {
        let mut executive = IndexExecutive::new(Arc::new(RankView { rank, size }));
        executive.set_arrays(vec!["T".to_string()]);
        executive.initialize(&report).unwrap();
        assert_eq!(
            executive.n_local_requests() as u64,
            block_partition(5, size, rank).count() as u64
        );
        while let Some(request) = executive.next_request() {
            let index = request.get_u64("time_step").unwrap() as usize;
            let dataset = pipeline.pull(PortHandle::new(source, 0), &request).await.unwrap();
            assert_eq!(serialize(&dataset), reference[index], "index {index}");
            seen += 1;
        }
    }
    assert_eq!(seen, 5);
}

#[tokio::test]
async fn bounds_and_matching_extent_yield_equal_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t.cfb");
    let values: Vec<f64> = (0..16).map(|i| i as f64).collect();
    write_input(
        &path,
        &[0.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0, 10.0, 20.0, 30.0],
        &[0.0, 10.0, 20.0, 30.0],
        &[("T", values)],
    );

    let (mut pipeline, source) = source_over(vec![path.to_string_lossy().into_owned()]);
    pipeline.update_metadata().await.unwrap();

    let mut by_bounds = request_for(0, &["T"]);
    by_bounds.set_f64s(keys::BOUNDS, vec![10.0, 20.0, 10.0, 20.0, 0.0, 0.0]);
    let mut by_extent = request_for(0, &["T"]);
    by_extent.set_u64s(keys::EXTENT, vec![1, 2, 1, 2, 0, 0]);

    let handle = PortHandle::new(source, 0);
    let a = pipeline.pull(handle, &by_bounds).await.unwrap();
    let b = pipeline.pull(handle, &by_extent).await.unwrap();
    assert_eq!(a.as_ref(), b.as_ref());
    let mesh = a.as_mesh().unwrap();
    assert_eq!(mesh.extent(), [1, 2, 1, 2, 0, 0]);
    assert_eq!(
        mesh.point_arrays.get("T").unwrap().as_f64s().unwrap(),
        &[5.0, 6.0, 9.0, 10.0]
    );
}

#[tokio::test]
async fn written_meshes_read_back_through_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.cfb");
    write_input(
        &input,
        &[0.0, 1.0],
        Some("days since 2000-01-01"),
        Some("standard"),
        &[0.0, 10.0],
        &[0.0, 10.0],
        &[("T", (0..8).map(|i| i as f64).collect())],
    );

    let (mut pipeline, source) = source_over(vec![input.to_string_lossy().into_owned()]);
    let writer = pipeline.add_stage(stages::create_stage("writer").unwrap());
    pipeline.connect(PortHandle::new(source, 0), writer, 0).unwrap();
    let out_pattern = dir.path().join("out_%t%.cfb");
    pipeline
        .set_property(writer, "file_name", out_pattern.to_string_lossy().into_owned().into())
        .unwrap();

    let mut executive = IndexExecutive::new(Arc::new(SelfCommunicator));
    executive.set_arrays(vec!["T".to_string()]);
    let outputs = pipeline
        .run(PortHandle::new(writer, 0), &mut executive)
        .await
        .unwrap();
    assert_eq!(outputs.len(), 2);

    // Step 1 of the input becomes step 0 of the written file.
    let reread = dir.path().join("out_1.cfb");
    let (mut second, source) = source_over(vec![reread.to_string_lossy().into_owned()]);
    second.update_metadata().await.unwrap();
    let dataset = second
        .pull(PortHandle::new(source, 0), &request_for(0, &["T"]))
        .await
        .unwrap();
    let mesh = dataset.as_mesh().unwrap();
    assert_eq!(mesh.time(), 1.0);
    assert_eq!(
        mesh.point_arrays.get("T").unwrap().as_f64s().unwrap(),
        &[4.0, 5.0, 6.0, 7.0]
    );
}
