//! Zone catalog persistence.
//!
//! A background thread polls the catalog version on a jittered half-second
//! cadence and rewrites the save file when the catalog changed and the save
//! interval has elapsed. Writes go to a temp file that is fsynced and then
//! renamed over the destination, so a failure at any step leaves the old
//! file untouched.
//!
//! File format:
//! ```text
//! file_version\n
//! motor_tilt\n               (added in version 2)
//! zone_count\n
//! name,xmin,ymin,zmin,xmax,ymax,zmax,param,on_level,off_level,on_delay,off_delay\n
//! ```
//! The viewing angle changed in version 3, the param..off_delay tail was
//! added in version 4, and version 5 switched from float meters to integer
//! millimeters.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Error, Result};
use crate::pipeline::PipelineState;
use crate::zone::ZoneCatalog;

/// Current save file format version.
const ZONE_FORMAT: i32 = 5;
const ZONE_FILENAME: &str = "zones.knd";

/// Pre-version-3 files used a wider viewing angle; scale x/y by
/// tan(28)/tan(35) on load.
const V3_ANGLE_SCALE: f32 = 0.759_359_765;

struct SaveState {
    last_version: u32,
    target: Instant,
}

struct Shared {
    catalog: Arc<ZoneCatalog>,
    pipeline: Arc<PipelineState>,
    savedir: PathBuf,
    interval: Duration,
    state: Mutex<SaveState>,
    stop: AtomicBool,
}

pub struct Saver {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Confirms the directory exists, is a directory, and accepts writes.
fn validate_savedir(dir: &Path) -> Result<()> {
    let meta = fs::metadata(dir).map_err(|e| {
        Error::Conflict(format!("Save location '{}' does not exist: {e}", dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(Error::Conflict(format!(
            "Save location '{}' is not a directory.",
            dir.display()
        )));
    }

    let probe = dir.join(format!(".knd-write-test.{}", std::process::id()));
    File::create(&probe)
        .and_then(|_| fs::remove_file(&probe))
        .map_err(|e| {
            Error::Conflict(format!("Save location '{}' is not writable: {e}", dir.display()))
        })?;

    Ok(())
}

impl Saver {
    /// Validates the save directory and starts the periodic save thread.
    pub fn init(
        catalog: Arc<ZoneCatalog>,
        pipeline: Arc<PipelineState>,
        savedir: &Path,
        interval: Duration,
    ) -> Result<Saver> {
        validate_savedir(savedir)?;

        let last_version = catalog.version();
        let shared = Arc::new(Shared {
            catalog,
            pipeline,
            savedir: savedir.to_path_buf(),
            interval,
            stop: AtomicBool::new(false),
            state: Mutex::new(SaveState {
                last_version,
                target: Instant::now(),
            }),
        });

        let worker = shared.clone();
        let thread = std::thread::Builder::new().name("save_thread".into()).spawn(move || {
            while !worker.stop.load(Ordering::Relaxed) {
                let jitter = rand::thread_rng().gen_range(0..100_000);
                std::thread::sleep(Duration::from_micros(500_000 + jitter));
                if worker.stop.load(Ordering::Relaxed) {
                    break;
                }
                if let Err(e) = check_save(&worker) {
                    tracing::error!("Error saving zones: {e}");
                }
            }
        })?;

        Ok(Saver { shared, thread: Some(thread) })
    }

    /// Unconditionally saves the catalog.
    pub fn save(&self) -> Result<()> {
        save_zones(&self.shared)
    }

    /// Loads zones from the save file if present. Existing zones are kept.
    /// Returns the number of zones read.
    pub fn load(&self) -> Result<usize> {
        let path = self.shared.savedir.join(ZONE_FILENAME);
        let text = fs::read_to_string(&path)?;
        let count = load_zones(&self.shared, &path, &text)?;

        let version = self.shared.catalog.version();
        self.shared.state.lock().expect("save lock").last_version = version;
        Ok(count)
    }

    /// Stops the save thread. Does not perform a final save.
    pub fn cleanup(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Saver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Saves when the interval has elapsed and the catalog version moved.
fn check_save(shared: &Shared) -> Result<()> {
    {
        let state = shared.state.lock().expect("save lock");
        if Instant::now() < state.target {
            return Ok(());
        }
        let version = shared.catalog.version();
        if version == u32::MAX || version == state.last_version {
            return Ok(());
        }
    }

    {
        let mut state = shared.state.lock().expect("save lock");
        state.target = Instant::now() + shared.interval;
    }

    tracing::info!("Saving zones.");
    save_zones(shared)
}

/// Writes the save file via a temp file and atomic rename.
fn save_zones(shared: &Shared) -> Result<()> {
    let tmppath = shared.savedir.join(format!("{ZONE_FILENAME}.tmp"));
    let path = shared.savedir.join(ZONE_FILENAME);

    let mut body = String::new();
    let mut count = 0usize;
    let mut lines = String::new();
    shared.catalog.for_each(|zone| {
        count += 1;
        let _ = writeln!(
            lines,
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            zone.name,
            zone.xmin,
            zone.ymin,
            zone.zmin,
            zone.xmax,
            zone.ymax,
            zone.zmax,
            zone.param.index(),
            zone.rising_threshold,
            zone.falling_threshold,
            zone.rising_delay,
            zone.falling_delay
        );
    });
    let _ = writeln!(body, "{ZONE_FORMAT}");
    let _ = writeln!(body, "{}", shared.pipeline.tilt());
    let _ = writeln!(body, "{count}");
    body.push_str(&lines);

    let mut file = File::create(&tmppath)?;
    file.write_all(body.as_bytes())?;
    file.flush()?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmppath, &path)?;

    let version = shared.catalog.version();
    shared.state.lock().expect("save lock").last_version = version;
    Ok(())
}

/// Parses and applies the save file contents. Zones with unparseable lines
/// are skipped with an error; the header count is advisory.
fn load_zones(shared: &Shared, path: &Path, text: &str) -> Result<usize> {
    let mut lines = text.lines();

    let filever: i32 = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| Error::invalid(format!("Error reading zone file version from '{}'", path.display())))?;

    if !(1..=ZONE_FORMAT).contains(&filever) {
        return Err(Error::invalid(format!(
            "Zone file version {filever} is unsupported (only versions 1-{ZONE_FORMAT} are supported)."
        )));
    }

    if filever >= 2 {
        match lines.next().and_then(|l| l.trim().parse::<i32>().ok()) {
            Some(tilt) => shared.pipeline.set_tilt(tilt),
            None => tracing::error!("Error reading motor tilt from '{}'", path.display()),
        }
    }

    if filever < 3 {
        tracing::info!("Converting zones to new viewing angle.");
    }

    let expected: usize = lines
        .next()
        .and_then(|l| l.trim().parse().ok())
        .ok_or_else(|| Error::invalid(format!("Error reading zone count from '{}'", path.display())))?;

    let mut read = 0usize;
    for (i, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        match parse_zone_line(line, filever) {
            Some(rec) => {
                if let Err(e) = apply_record(shared, &rec) {
                    tracing::error!(
                        "Error adding zone {} ('{}') from '{}' to the zone list: {e}",
                        i + 1,
                        rec.name,
                        path.display()
                    );
                    continue;
                }
                read += 1;
            }
            None => {
                tracing::error!(
                    "Error reading zone {} from '{}': invalid zone format.",
                    i + 1,
                    path.display()
                );
            }
        }
    }

    if read != expected {
        tracing::warn!(
            "Zone count mismatch in '{}': read {} zones, expected {}.",
            path.display(),
            read,
            expected
        );
    }

    Ok(read)
}

struct ZoneRecord {
    name: String,
    coords: [i32; 6],
    tuning: Option<(i32, i32, i32, i32, i32)>,
}

fn parse_zone_line(line: &str, filever: i32) -> Option<ZoneRecord> {
    let mut fields = line.split(',');
    let mut name = fields.next()?.to_string();
    name.truncate(crate::zone::ZONE_NAME_LENGTH);

    let rest: Vec<&str> = fields.collect();

    let (mut coords, tail) = if filever < 5 {
        if rest.len() < 6 {
            return None;
        }
        let mut f = [0f32; 6];
        for (i, v) in rest[..6].iter().enumerate() {
            f[i] = v.trim().parse().ok()?;
        }
        if filever < 3 {
            // Scale to the new viewing angle.
            f[0] *= V3_ANGLE_SCALE;
            f[3] *= V3_ANGLE_SCALE;
            f[1] *= V3_ANGLE_SCALE;
            f[4] *= V3_ANGLE_SCALE;
        }
        // Meters to millimeters.
        let c = [
            (f[0] * 1000.0) as i32,
            (f[1] * 1000.0) as i32,
            (f[2] * 1000.0) as i32,
            (f[3] * 1000.0) as i32,
            (f[4] * 1000.0) as i32,
            (f[5] * 1000.0) as i32,
        ];
        (c, &rest[6..])
    } else {
        if rest.len() < 6 {
            return None;
        }
        let mut c = [0i32; 6];
        for (i, v) in rest[..6].iter().enumerate() {
            c[i] = v.trim().parse().ok()?;
        }
        (c, &rest[6..])
    };

    // Widen zero-extent boxes so old hand-edited files still load.
    if coords[0] == coords[3] {
        coords[3] = coords[0] + 100;
    }
    if coords[1] == coords[4] {
        coords[4] = coords[1] + 100;
    }
    if coords[2] == coords[5] {
        coords[5] = coords[2] + 100;
    }

    let tuning = if filever >= 4 {
        if tail.len() < 5 {
            return None;
        }
        let mut t = [0i32; 5];
        for (i, v) in tail[..5].iter().enumerate() {
            t[i] = v.trim().parse().ok()?;
        }
        Some((t[0], t[1], t[2], t[3], t[4]))
    } else {
        None
    };

    Some(ZoneRecord { name, coords, tuning })
}

fn apply_record(shared: &Shared, rec: &ZoneRecord) -> Result<()> {
    shared.catalog.add(&rec.name, rec.coords)?;
    if let Some((param, rising, falling, rdelay, fdelay)) = rec.tuning {
        shared
            .catalog
            .load_tuning(&rec.name, param, rising, falling, rdelay, fdelay)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    static TEST_DIR_SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "knd-save-test-{}-{}",
            std::process::id(),
            TEST_DIR_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn saver(dir: &Path) -> (Saver, Arc<ZoneCatalog>, Arc<PipelineState>) {
        crate::lut::init();
        let catalog = Arc::new(ZoneCatalog::new(2, 2));
        let pipeline = PipelineState::new();
        let saver =
            Saver::init(catalog.clone(), pipeline.clone(), dir, Duration::from_secs(2)).unwrap();
        (saver, catalog, pipeline)
    }

    #[test]
    fn test_savedir_must_exist() {
        let catalog = Arc::new(ZoneCatalog::new(2, 2));
        let pipeline = PipelineState::new();
        let missing = std::env::temp_dir().join("knd-save-test-definitely-missing");
        assert!(
            Saver::init(catalog, pipeline, &missing, Duration::from_secs(2)).is_err()
        );
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = test_dir();
        let (saver1, catalog, pipeline) = saver(&dir);

        catalog.add("Living Room", [-500, -400, 600, 500, 400, 1800]).unwrap();
        catalog.set_attr("Living Room", "param", "bright").unwrap();
        catalog.set_attr("Living Room", "on_level", "420").unwrap();
        catalog.set_attr("Living Room", "off_level", "111").unwrap();
        catalog.set_attr("Living Room", "on_delay", "3").unwrap();
        catalog.set_attr("Living Room", "off_delay", "7").unwrap();
        catalog.add("Door", [100, 100, 900, 300, 300, 1200]).unwrap();
        pipeline.set_tilt(9);

        saver1.save().unwrap();
        saver1.cleanup();

        let (saver2, catalog2, pipeline2) = saver(&dir);
        let n = saver2.load().unwrap();
        assert_eq!(n, 2);
        assert_eq!(pipeline2.tilt(), 9);
        assert_eq!(catalog2.len(), 2);

        let mut seen = Vec::new();
        catalog2.for_each(|z| {
            seen.push((
                z.name.clone(),
                [z.xmin, z.ymin, z.zmin, z.xmax, z.ymax, z.zmax],
                z.param,
                z.rising_threshold,
                z.falling_threshold,
                z.rising_delay,
                z.falling_delay,
            ))
        });
        assert_eq!(seen[0].0, "Living Room");
        assert_eq!(seen[0].1, [-500, -400, 600, 500, 400, 1800]);
        assert_eq!(seen[0].2, crate::zone::Param::Bright);
        assert_eq!(seen[0].3, 420);
        assert_eq!(seen[0].4, 111);
        assert_eq!(seen[0].5, 3);
        assert_eq!(seen[0].6, 7);
        assert_eq!(seen[1].0, "Door");

        saver2.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_is_atomic_replace() {
        let dir = test_dir();
        let (saver, catalog, _pipeline) = saver(&dir);
        catalog.add("A", [0, 0, 500, 100, 100, 1000]).unwrap();
        saver.save().unwrap();
        assert!(dir.join(ZONE_FILENAME).exists());
        assert!(!dir.join(format!("{ZONE_FILENAME}.tmp")).exists());
        saver.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_v1_meters_and_angle() {
        let dir = test_dir();
        let (saver, catalog, _pipeline) = saver(&dir);
        // Version 1: no tilt line, float meters, old viewing angle.
        fs::write(
            dir.join(ZONE_FILENAME),
            "1\n1\nOld,-1.0,-1.0,0.5,1.0,1.0,2.0\n",
        )
        .unwrap();
        assert_eq!(saver.load().unwrap(), 1);
        let mut seen = None;
        catalog.for_each(|z| seen = Some([z.xmin, z.ymin, z.zmin, z.xmax, z.ymax, z.zmax]));
        let c = seen.unwrap();
        assert_eq!(c[0], -759);
        assert_eq!(c[3], 759);
        assert_eq!(c[2], 500);
        assert_eq!(c[5], 2000);
        saver.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_skips_bad_lines_and_warns_on_count() {
        let dir = test_dir();
        let (saver, catalog, pipeline) = saver(&dir);
        fs::write(
            dir.join(ZONE_FILENAME),
            "5\n-4\n3\nGood,0,0,500,100,100,1000,0,160,140,1,1\nBad,not,numbers,at,all,x,y,0,160,140,1,1\n",
        )
        .unwrap();
        // Count says 3, one line is garbage; the parsed count wins.
        assert_eq!(saver.load().unwrap(), 1);
        assert_eq!(catalog.len(), 1);
        assert_eq!(pipeline.tilt(), -4);
        saver.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_zero_extent_widened() {
        let dir = test_dir();
        let (saver, catalog, _pipeline) = saver(&dir);
        fs::write(
            dir.join(ZONE_FILENAME),
            "5\n0\n1\nFlat,100,0,500,100,100,1000,0,160,140,1,1\n",
        )
        .unwrap();
        assert_eq!(saver.load().unwrap(), 1);
        let mut x = (0, 0);
        catalog.for_each(|z| x = (z.xmin, z.xmax));
        assert_eq!(x, (100, 200));
        saver.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_check_save_waits_for_version_change() {
        let dir = test_dir();
        let (saver, catalog, _pipeline) = saver(&dir);
        // Nothing changed since init: the periodic thread must not write.
        std::thread::sleep(Duration::from_millis(800));
        assert!(!dir.join(ZONE_FILENAME).exists());

        catalog.add("A", [0, 0, 500, 100, 100, 1000]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !dir.join(ZONE_FILENAME).exists() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(dir.join(ZONE_FILENAME).exists(), "periodic save fired");
        saver.cleanup();
        let _ = fs::remove_dir_all(&dir);
    }
}
