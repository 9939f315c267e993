//! Reckon - the relational spreadsheet data engine, serving a host over
//! stdin/stdout.

use reckon::sandbox::Sandbox;

fn main() -> anyhow::Result<()> {
    env_logger::init();
    log::info!("reckon engine starting");

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut input = stdin.lock();
    let mut output = stdout.lock();

    let mut sandbox = Sandbox::new();
    sandbox.run(&mut input, &mut output)?;

    log::info!("reckon engine exiting");
    Ok(())
}
