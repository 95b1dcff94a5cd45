//! Top-level orchestration: stage 1, then repeated stage-2 merges chosen
//! by the Huffman scheduler, until one run remains.

use std::fs::File;
use std::sync::Mutex;

use log::info;

use crate::config::Config;
use crate::error::SortResult;
use crate::huffman::HuffmanScheduler;
use crate::key::Key;
use crate::run_index::RunIndex;
use crate::run_io::{move_file, run_path};
use crate::stage1::run_stage1;
use crate::stage2::run_stage2_job;
use crate::validate;

/// Runs the whole sort described by `config` for key type `K`.
pub fn run<K: Key>(config: &Config) -> SortResult<()> {
    let run_index = Mutex::new(RunIndex::new());

    info!("stage 1: generating runs from {}", config.input.display());
    let total_runs = run_stage1::<K>(&config.input, &config.prefix, config.buffer_capacity, &run_index)?;
    info!("stage 1 complete: {} run(s) produced", total_runs);

    if config.validate {
        let index = run_index.lock().unwrap();
        let mut ids: Vec<u64> = (1..=total_runs).collect();
        ids.sort_unstable();
        drop(index);
        for id in ids {
            validate::check_sorted::<K>(&run_path(&config.prefix, id))?;
        }
        info!("validate: every stage-1 run is sorted");
    }

    let mut scheduler = HuffmanScheduler::new(total_runs);

    loop {
        let job = {
            let mut index = run_index.lock().unwrap();
            if index.len() <= 1 {
                break;
            }
            scheduler.forward(config.fan_in, &mut index)
        };
        let Some(popped) = job else { break };

        let ids: Vec<u64> = popped.iter().map(|(id, _)| *id).collect();
        let out_id = scheduler.run_limit();
        info!("stage 2: merging runs {:?} into run {}", ids, out_id);
        run_stage2_job::<K>(&config.prefix, &ids, out_id, config.buffer_capacity)?;
        for id in &ids {
            let path = run_path(&config.prefix, *id);
            std::fs::remove_file(&path).map_err(|e| crate::error::SortError::io(path, e))?;
        }
    }

    let remaining = {
        let mut index = run_index.lock().unwrap();
        index.pop_shortest()
    };

    match remaining {
        Some((id, _length)) => {
            move_file(&run_path(&config.prefix, id), &config.output)
                .map_err(|e| crate::error::SortError::io(config.output.clone(), e))?;
        }
        None => {
            // Empty input: no runs were ever produced.
            File::create(&config.output).map_err(|e| crate::error::SortError::io(config.output.clone(), e))?;
        }
    }
    info!("output written to {}", config.output.display());

    if config.validate {
        validate::check_sorted::<K>(&config.output)?;
        validate::check_multiset_equal::<K>(&config.input, &config.output)?;
        info!("validate: output is sorted and preserves the input multiset");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryInto;
    use std::io::Write;

    fn write_input(path: &std::path::Path, keys: &[u32]) {
        let mut f = File::create(path).unwrap();
        for k in keys {
            f.write_all(&k.to_le_bytes()).unwrap();
        }
    }

    fn read_output(path: &std::path::Path) -> Vec<u32> {
        let bytes = std::fs::read(path).unwrap();
        bytes.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect()
    }

    fn run_config(dir: &std::path::Path, keys: &[u32], buffer_capacity: usize, fan_in: usize) -> Config {
        let input = dir.join("input");
        write_input(&input, keys);
        Config {
            input,
            output: dir.join("output"),
            prefix: dir.join("run_"),
            buffer_capacity,
            fan_in,
            validate: true,
            key_bytes: 4,
        }
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), &[], 8, 4);
        run::<u32>(&config).unwrap();
        assert_eq!(read_output(&config.output), Vec::<u32>::new());
    }

    #[test]
    fn single_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let config = run_config(dir.path(), &[5], 8, 4);
        run::<u32>(&config).unwrap();
        assert_eq!(read_output(&config.output), vec![5]);
    }

    #[test]
    fn scenario_matches_documented_huffman_trace() {
        let dir = tempfile::tempdir().unwrap();
        let keys = vec![3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9];
        let config = run_config(dir.path(), &keys, 4, 3);
        run::<u32>(&config).unwrap();
        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(read_output(&config.output), expected);
    }

    #[test]
    fn no_run_files_remain_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let keys: Vec<u32> = (0..50).rev().collect();
        let config = run_config(dir.path(), &keys, 4, 3);
        run::<u32>(&config).unwrap();

        let leftover = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("run_"))
            .count();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn large_random_input_sorts_correctly() {
        use rand::Rng;
        let dir = tempfile::tempdir().unwrap();
        let mut rng = rand::thread_rng();
        let keys: Vec<u32> = (0..2000).map(|_| rng.gen()).collect();
        let config = run_config(dir.path(), &keys, 37, 5);
        run::<u32>(&config).unwrap();
        let mut expected = keys.clone();
        expected.sort_unstable();
        assert_eq!(read_output(&config.output), expected);
    }
}
