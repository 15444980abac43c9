//! Print an m4a file's tags and save its cover art
use std::env;
use std::fs::File;
use std::io::BufReader;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <m4a-file> <cover-output>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let mut f = BufReader::new(File::open(path).expect("Failed to open file"));

    match m4a_parse::read_metadata(&mut f) {
        Ok(tuple) => {
            println!("File: {}", path);
            println!("Title: {}", tuple.title.as_deref().unwrap_or("-"));
            println!("Artist: {}", tuple.artist.as_deref().unwrap_or("-"));
            println!("Album: {}", tuple.album.as_deref().unwrap_or("-"));
            if let Some(quality) = &tuple.quality {
                println!("Quality: {}", quality);
            }
            if let Some(ms) = tuple.length_ms {
                println!("Length: {}:{:02}", ms / 60_000, ms / 1000 % 60);
            }
        }
        Err(e) => eprintln!("No metadata: {}", e),
    }

    let mut f = File::open(path).expect("Failed to open file");
    match m4a_parse::read_itunes_cover(&mut f) {
        Ok(cover) => {
            std::fs::write(&args[2], &cover[..]).expect("Failed to write cover");
            println!("Cover: {} bytes -> {}", cover.len(), args[2]);
        }
        Err(e) => {
            eprintln!("No cover: {}", e);
            std::process::exit(1);
        }
    }
}
