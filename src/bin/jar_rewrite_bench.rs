//! Instruments every class in a jar and reports throughput.
//!
//! ```text
//! cargo run --release --features bench-tools --bin jar_rewrite_bench -- rt.jar
//! ```

use std::env;
use std::fs::File;
use std::io::Read;
use std::time::{Duration, Instant};

use heapster::rewrite::{instrument_class, HelperSpec};
use zip::ZipArchive;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let Some(jar_path) = env::args().nth(1) else {
        eprintln!("usage: jar_rewrite_bench JAR_PATH");
        std::process::exit(2);
    };
    let file = File::open(&jar_path)?;
    let mut zip = ZipArchive::new(file)?;
    let helper = HelperSpec::default();

    let mut class_files: u64 = 0;
    let mut input_bytes: u64 = 0;
    let mut output_bytes: u64 = 0;
    let mut rewritten: u64 = 0;
    let mut unchanged: u64 = 0;
    let mut failed: u64 = 0;
    let mut sites: u64 = 0;
    let mut elapsed = Duration::ZERO;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        if !entry.name().ends_with(".class") {
            continue;
        }
        let name = entry.name().to_owned();
        class_files += 1;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;
        input_bytes += bytes.len() as u64;

        let start = Instant::now();
        let result = instrument_class(&bytes, false, &helper);
        elapsed += start.elapsed();

        match result {
            Ok(Some(instrumented)) => {
                rewritten += 1;
                sites += instrumented.stats.sites as u64;
                output_bytes += instrumented.image.len() as u64;
            }
            Ok(None) => {
                unchanged += 1;
                output_bytes += bytes.len() as u64;
            }
            Err(err) => {
                failed += 1;
                eprintln!("{name}: {err}");
            }
        }
    }

    let secs = elapsed.as_secs_f64();
    let mb = input_bytes as f64 / (1024.0 * 1024.0);
    let ns_per = if class_files > 0 { elapsed.as_nanos() as f64 / class_files as f64 } else { 0.0 };
    let growth = if input_bytes > 0 { output_bytes as f64 / input_bytes as f64 } else { 1.0 };

    println!("jar_path={jar_path}");
    println!("class_files={class_files}");
    println!("rewritten={rewritten} unchanged={unchanged} failed={failed}");
    println!("sites={sites}");
    println!("total_mb={mb:.3}");
    println!("size_ratio={growth:.4}");
    println!("rewrite_time_ms={:.3}", secs * 1000.0);
    println!("ns_per_class={ns_per:.1}");
    println!("mb_per_s={:.2}", if secs > 0.0 { mb / secs } else { 0.0 });

    Ok(())
}
