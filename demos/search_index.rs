//! Query a breed database with one of its own vectors and print the vote.
//!
//! ```text
//! cargo run --example search_index -- data/breeds/dog 17
//! ```

use anyhow::{Context, Result};
use pawsight::index::BreedDatabase;
use pawsight::vote::{self, Aggregation};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("info"))
        .init();

    let mut args = std::env::args().skip(1);
    let dir = PathBuf::from(args.next().unwrap_or_else(|| "data/breeds/dog".to_string()));
    let position: usize = args.next().map_or(Ok(0), |s| s.parse())?;

    let db = BreedDatabase::open(&dir).with_context(|| format!("opening {}", dir.display()))?;
    let query = db
        .index
        .reconstruct(position)
        .with_context(|| format!("position {position} out of range"))?
        .to_owned();

    let hits = db.index.search(query.view(), 50)?;
    println!("query #{position} labeled {}", db.id_map.breed(position));
    for row in vote::vote_table(&hits, &db.id_map, Aggregation::Max).iter().take(10) {
        println!(
            "{:>3}  {:>6}  {:.3}  {:.3}  {}",
            row.rank, row.index, row.score, row.breed_vote, row.breed
        );
    }
    for candidate in vote::rank(&hits, &db.id_map, Aggregation::Max, 5) {
        println!("#{} {} ({:.3})", candidate.rank, candidate.breed, candidate.score);
    }
    Ok(())
}
