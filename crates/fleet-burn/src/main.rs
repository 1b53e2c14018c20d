//! Keep `n` CPUs busy until killed.
use std::{hint::black_box, thread};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "fleet-burn", version, about = "Block CPUs with busy loops")]
struct Cli {
    /// Number of CPUs to block.
    #[arg(short = 'n', long = "num-cpu", default_value_t = 1)]
    num_cpu: u32,
}

fn spin() {
    let mut x: u64 = 0;
    loop {
        x = black_box(x.wrapping_add(1));
    }
}

fn main() {
    let cli = Cli::parse();
    println!("Blocking {} cpu with an infinite loop", cli.num_cpu);

    let workers: Vec<_> = (0..cli.num_cpu).map(|_| thread::spawn(spin)).collect();
    for w in workers {
        let _ = w.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_one_cpu() {
        assert_eq!(Cli::try_parse_from(["fleet-burn"]).unwrap().num_cpu, 1);
        assert_eq!(Cli::try_parse_from(["fleet-burn", "-n", "4"]).unwrap().num_cpu, 4);
        assert!(Cli::try_parse_from(["fleet-burn", "-n", "four"]).is_err());
    }
}
