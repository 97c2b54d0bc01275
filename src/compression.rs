use {
    serde::{Deserialize, Serialize},
    std::io::{Error, Read, Write},
};

/// Compression applied to the body of baked scene and texture files.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Brotli,
    Snap,
}

impl Compression {
    const BROTLI_BUFFER_SIZE: usize = 4096;
    const BROTLI_QUALITY: u32 = 9;
    const BROTLI_WINDOW: u32 = 22;

    pub fn new_reader<'a>(self, reader: impl Read + 'a) -> Box<dyn Read + 'a> {
        match self {
            Self::Brotli => Box::new(brotli::Decompressor::new(
                reader,
                Self::BROTLI_BUFFER_SIZE,
            )),
            Self::Snap => Box::new(snap::read::FrameDecoder::new(reader)),
        }
    }

    pub fn new_writer<'a>(self, writer: impl Write + 'a) -> Box<dyn Write + 'a> {
        match self {
            Self::Brotli => Box::new(brotli::CompressorWriter::new(
                writer,
                Self::BROTLI_BUFFER_SIZE,
                Self::BROTLI_QUALITY,
                Self::BROTLI_WINDOW,
            )),
            Self::Snap => Box::new(snap::write::FrameEncoder::new(writer)),
        }
    }

    pub fn compress(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = vec![];

        // The writer must drop before the buffer is complete
        {
            let mut writer = self.new_writer(&mut buf);
            writer.write_all(data)?;
            writer.flush()?;
        }

        Ok(buf)
    }

    pub fn decompress(self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = vec![];
        self.new_reader(data).read_to_end(&mut buf)?;

        Ok(buf)
    }

    /// Appends a one byte compression tag followed by the (optionally compressed) body to `buf`.
    pub(crate) fn pack(
        compression: Option<Self>,
        body: &[u8],
        buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        match compression {
            None => {
                buf.push(0);
                buf.extend_from_slice(body);
            }
            Some(compression) => {
                buf.push(match compression {
                    Self::Brotli => 1,
                    Self::Snap => 2,
                });
                buf.extend(compression.compress(body)?);
            }
        }

        Ok(())
    }

    /// Inverse of [`Compression::pack`].
    pub(crate) fn unpack(buf: &[u8]) -> anyhow::Result<Vec<u8>> {
        let Some((&tag, body)) = buf.split_first() else {
            anyhow::bail!("Missing compression tag");
        };

        Ok(match tag {
            0 => body.to_vec(),
            1 => Self::Brotli.decompress(body)?,
            2 => Self::Snap.decompress(body)?,
            _ => anyhow::bail!("Unknown compression tag {tag}"),
        })
    }
}
