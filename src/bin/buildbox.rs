fn main() -> anyhow::Result<()> {
    buildbox::cli::run()
}
