use anyhow::Result;

fn main() -> Result<()> {
    bidbox::cli::run()
}
