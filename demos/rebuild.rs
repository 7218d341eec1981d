use std::{env, fs};

use nitrokit::formats::banner::Language;
use nitrokit::{Error, NdsRom, RebuildOptions, Result};

fn read(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Open(path.into(), e))
}

fn main() -> Result<()> {
    env_logger::init();
    let mut args = env::args().skip(1);
    let (Some(input), Some(output)) = (args.next(), args.next()) else {
        eprintln!("usage: rebuild <in.nds> <out.nds> [<path in image>=<replacement>...]");
        return Ok(());
    };

    let mut rom = NdsRom::open(&input)?;
    let title = rom.banner.as_ref().and_then(|b| b.title(Language::English));
    println!(
        "{} ({}): {} files, {} overlays",
        title.as_deref().unwrap_or(&rom.header.game_title()),
        rom.header.game_code_str(),
        rom.fat.len(),
        rom.overlay_count()
    );

    for arg in args {
        let Some((path, replacement)) = arg.split_once('=') else {
            continue;
        };
        match path {
            "arm9i.bin" => rom.replace_arm9i(read(replacement)?)?,
            "arm7i.bin" => rom.replace_arm7i(read(replacement)?)?,
            _ => match rom.file_mut(path) {
                Some(f) => f.redirect_path(replacement)?,
                None => eprintln!("no file '{path}' in image"),
            },
        }
    }

    let report = rom.save_as(&input, &output, &RebuildOptions::default())?;
    println!(
        "wrote {output}: rom size {:#x}, image {:#x}",
        report.rom_size, report.image_size
    );
    if let Some(sig) = report.signature {
        println!("header signature: {sig:?}");
    }
    Ok(())
}
