//! Embeds git metadata and the build timestamp for `tollgate::version`.

use vergen_gitcl::{Build, Emitter, Gitcl};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let git = Gitcl::builder().branch(true).sha(true).dirty(true).build();
    let build = Build::builder().build_timestamp(true).build();

    // outside a git checkout the VERGEN_GIT_* variables are simply absent
    Emitter::default()
        .add_instructions(&git)?
        .add_instructions(&build)?
        .emit()?;
    Ok(())
}
