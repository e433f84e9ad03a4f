mod simulate;

use structopt::StructOpt;

#[derive(StructOpt)]
pub enum Options {
    Simulate(simulate::SimulateOptions),
}

fn main() -> anyhow::Result<()> {
    match Options::from_args() {
        Options::Simulate(options) => options.run(),
    }
}
