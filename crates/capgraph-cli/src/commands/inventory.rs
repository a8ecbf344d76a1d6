use crate::catalogue;
use crate::error::Result;

pub fn functors() -> Result<()> {
    let registries = catalogue::rollcall()?;
    print!("{}", registries.functors.describe());
    Ok(())
}

pub fn backends() -> Result<()> {
    let registries = catalogue::rollcall()?;
    print!("{}", registries.backends.describe());
    Ok(())
}
