fn main() -> anyhow::Result<()> {
    emufi::run()
}
