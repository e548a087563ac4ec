// Build script for the traceroute race binary
// Copies the sample config file to the output directory after build

use std::env;
use std::fs;
use std::path::Path;

fn main() {
    // Tell Cargo to rerun this script if the config file changes
    println!("cargo:rerun-if-changed=traceroute_race.toml");

    let Ok(out_dir) = env::var("OUT_DIR") else {
        return;
    };

    // OUT_DIR = target/<profile>/build/<crate>-<hash>/out
    let Some(target_dir) = Path::new(&out_dir).ancestors().nth(3) else {
        return;
    };

    let config_src = Path::new("traceroute_race.toml");
    let config_dst = target_dir.join("traceroute_race.toml");

    if config_src.exists() && fs::copy(config_src, &config_dst).is_ok() {
        println!(
            "cargo:warning=Copied config file to {}",
            config_dst.display()
        );
    }
}
