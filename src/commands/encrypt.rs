use std::path::PathBuf;

use log::info;

use crate::BoxError;

pub struct EncryptArgs {
    pub password1: String,
    pub password2: String,
    pub passfile: PathBuf,
}

/// Encrypts the two archive passwords and writes them to the password file
/// for later backup-mode runs.
pub fn run(args: EncryptArgs) -> Result<(), BoxError> {
    let store = super::password_store(args.passfile.clone())?;

    store.save(&args.password1, &args.password2)?;

    info!("passwords saved to {}", args.passfile.display());

    Ok(())
}
