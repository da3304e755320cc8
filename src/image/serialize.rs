//! The serialiser: emits one file per image — header, optional block table,
//! data (raw or LZ4 blocks), padding, bitmap — with secondaries written
//! before the primary and the primary header written last.

use crate::error::ImageError;
use crate::image::sections::{
    header_flags, ImageBlock, ImageHeader, SectionKind, IMAGE_HEADER_SIZE, IMAGE_MAGIC,
    IMAGE_VERSION,
};
use crate::image::writer::ImageWriter;
use crate::image::{ImageOutput, ImageWriteResult};
use crate::options::StorageMode;
use crate::util::checksum::Adler32;
use crate::util::constants::ELF_SEGMENT_ALIGNMENT;
use crate::util::conversions::raw_align_up;
use bytemuck::Zeroable;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Per-file layout facts produced while writing the body, needed by the
/// header written afterwards.
struct BodyLayout {
    blocks_offset: u32,
    blocks_count: u32,
    data_size: u32,
    bytes_written: u64,
}

impl<'r> ImageWriter<'r> {
    pub(crate) fn serialize_images(
        &mut self,
        outputs: Vec<ImageOutput>,
    ) -> Result<Vec<ImageWriteResult>, ImageError> {
        let image_count = self.image_infos.len();
        let mut files: Vec<File> = Vec::with_capacity(image_count);
        for output in outputs {
            files.push(match output {
                ImageOutput::Path(path) => File::create(&path).map_err(|e| {
                    warn!("failed to open image file {}: {}", path.display(), e);
                    ImageError::Io(e)
                })?,
                ImageOutput::File(file) => file,
            });
        }

        // The primary carries the XOR of every image's data checksum; a
        // reader holding all files can recompute and cross-check it.
        let combined_checksum = self
            .image_infos
            .iter()
            .fold(0u32, |acc, info| acc ^ info.data_checksum);

        let mut results: Vec<Option<ImageWriteResult>> = (0..image_count).map(|_| None).collect();
        for index in 1..image_count {
            let layout = self.write_image_body(&mut files[index], index)?;
            let checksum = self.image_infos[index].data_checksum;
            self.write_image_header(&mut files[index], index, checksum, &layout)?;
            results[index] = Some(ImageWriteResult {
                checksum,
                bytes_written: layout.bytes_written,
            });
        }

        // Primary body, then — only now — its header. A crash before this
        // point leaves no valid primary, hence no usable image set.
        let layout = self.write_image_body(&mut files[0], 0)?;
        self.write_image_header(&mut files[0], 0, combined_checksum, &layout)?;
        results[0] = Some(ImageWriteResult {
            checksum: combined_checksum,
            bytes_written: layout.bytes_written,
        });

        info!(
            "wrote {} image(s), primary checksum {:#010x}",
            image_count, combined_checksum
        );
        Ok(results.into_iter().map(|r| r.expect("image result")).collect())
    }

    fn write_image_body(&self, file: &mut File, index: usize) -> Result<BodyLayout, ImageError> {
        let info = &self.image_infos[index];
        let data = &info.image_data[IMAGE_HEADER_SIZE..];
        let bitmap = info
            .image_bitmap
            .as_ref()
            .expect("bitmap not allocated")
            .to_bytes();

        // The checksum was fixed when the tables were serialised; recompute
        // over what is about to hit the disk and refuse to write a
        // mismatch.
        let mut rolling = Adler32::new();
        rolling.update(data);
        rolling.update(&bitmap);
        if rolling.value() != info.data_checksum {
            return Err(ImageError::Consistency(format!(
                "image {} data checksum drifted between copy and write",
                index
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&[0u8; IMAGE_HEADER_SIZE])?;
        let mut file_pos = IMAGE_HEADER_SIZE;

        let (blocks_offset, blocks_count, data_size) = match self.options.storage_mode {
            StorageMode::Uncompressed => {
                file.write_all(data)?;
                file_pos += data.len();
                (0u32, 0u32, data.len() as u32)
            }
            StorageMode::Lz4 | StorageMode::Lz4hc => {
                let block_size = self.options.max_image_block_size as usize;
                let chunks: Vec<&[u8]> = data.chunks(block_size).collect();
                let compressed = compress_blocks(&chunks, self.options.storage_mode);

                let table_size = chunks.len() * std::mem::size_of::<ImageBlock>();
                let mut blocks: Vec<ImageBlock> = Vec::with_capacity(chunks.len());
                let mut data_pos = IMAGE_HEADER_SIZE + table_size;
                for (i, block_bytes) in compressed.iter().enumerate() {
                    blocks.push(ImageBlock {
                        storage_mode: self.options.storage_mode as u32,
                        data_offset: data_pos as u32,
                        data_size: block_bytes.len() as u32,
                        image_offset: (IMAGE_HEADER_SIZE + i * block_size) as u32,
                        image_size: chunks[i].len() as u32,
                    });
                    data_pos += block_bytes.len();
                }
                file.write_all(bytemuck::cast_slice(&blocks))?;
                let mut total = 0usize;
                for bytes in &compressed {
                    file.write_all(bytes)?;
                    total += bytes.len();
                }
                file_pos = IMAGE_HEADER_SIZE + table_size + total;
                debug!(
                    "image {}: compressed {} -> {} bytes in {} blocks",
                    index,
                    data.len(),
                    total,
                    blocks.len()
                );
                (IMAGE_HEADER_SIZE as u32, blocks.len() as u32, total as u32)
            }
        };

        // The bitmap's file offset is ELF-segment aligned so the loader can
        // map it directly.
        let bitmap_offset = raw_align_up(file_pos, ELF_SEGMENT_ALIGNMENT);
        if bitmap_offset > file_pos {
            file.write_all(&vec![0u8; bitmap_offset - file_pos])?;
        }
        file.write_all(&bitmap)?;

        Ok(BodyLayout {
            blocks_offset,
            blocks_count,
            data_size,
            bytes_written: (bitmap_offset + bitmap.len()) as u64,
        })
    }

    fn write_image_header(
        &self,
        file: &mut File,
        index: usize,
        checksum: u32,
        layout: &BodyLayout,
    ) -> Result<(), ImageError> {
        let info = &self.image_infos[index];
        let mut header = ImageHeader::zeroed();
        header.magic = IMAGE_MAGIC;
        header.version = IMAGE_VERSION;
        header.image_begin = info.image_begin;
        header.image_size = info.image_size as u64;
        header.oat_checksum = info.oat_file.checksum();
        header.oat_data_begin = info.oat_file.data_begin();
        header.oat_data_end = info.oat_file.data_end();
        if let Some(boot) = self.runtime.boot_image() {
            header.boot_image_begin = boot.begin;
            header.boot_image_size = boot.size;
            header.boot_image_checksum = boot.checksums.iter().fold(0, |acc, &c| acc ^ c);
        }
        header.image_roots = self.relocated_address(info.image_roots);
        header.image_reservation_size = if index == 0 {
            self.image_infos.iter().map(|i| i.image_size as u32).sum()
        } else {
            info.image_size as u32
        };
        header.component_count = info.component_count;
        header.image_checksum = checksum;
        header.pointer_size = self.options.pointer_size().bytes() as u32;
        header.flags = match self.options.image_kind {
            crate::options::ImageKind::BootImage => 0,
            crate::options::ImageKind::BootImageExtension => header_flags::BOOT_IMAGE_EXTENSION,
            crate::options::ImageKind::AppImage => header_flags::APP_IMAGE,
        };
        header.storage_mode = self.options.storage_mode as u32;
        header.data_size = layout.data_size;
        header.blocks_offset = layout.blocks_offset;
        header.blocks_count = layout.blocks_count;
        for kind in 0..SectionKind::COUNT {
            header.sections[kind] = info.sections[index_to_kind(kind)];
        }

        file.seek(SeekFrom::Start(0))?;
        file.write_all(bytemuck::bytes_of(&header))?;
        file.flush()?;
        Ok(())
    }
}

fn index_to_kind(index: usize) -> SectionKind {
    use strum::IntoEnumIterator;
    SectionKind::iter().nth(index).expect("section index")
}

/// Compress blocks over a worker pool, one block per task, joining before
/// returning. Falls back to inline compression when a single worker would
/// do. Block outputs are positionally indexed, so the fan-out cannot
/// perturb the result.
fn compress_blocks(chunks: &[&[u8]], mode: StorageMode) -> Vec<Vec<u8>> {
    debug_assert!(mode.is_compressed());
    let workers = num_cpus::get().min(chunks.len());
    if workers <= 1 {
        return chunks.iter().map(|c| lz4_flex::block::compress(c)).collect();
    }
    let mut results: Vec<Vec<u8>> = vec![Vec::new(); chunks.len()];
    crossbeam::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            handles.push(scope.spawn(move |_| {
                let mut out = Vec::new();
                let mut index = worker;
                while index < chunks.len() {
                    out.push((index, lz4_flex::block::compress(chunks[index])));
                    index += workers;
                }
                out
            }));
        }
        for handle in handles {
            for (index, bytes) in handle.join().expect("compression worker panicked") {
                results[index] = bytes;
            }
        }
    })
    .expect("compression scope panicked");
    results
}

/// The result of reading an image file back for validation.
pub struct ImageValidation {
    pub header: ImageHeader,
    /// Checksum recomputed over the (decompressed) data and the bitmap.
    pub data_checksum: u32,
    /// The uncompressed data region, without the header.
    pub data: Vec<u8>,
    pub bitmap: Vec<u8>,
}

impl ImageValidation {
    /// The bytes of one section, sliced out of the decompressed data.
    pub fn section_bytes(&self, kind: SectionKind) -> &[u8] {
        let section = self.header.section(kind);
        if kind == SectionKind::ImageBitmap {
            return &self.bitmap;
        }
        let start = section.offset as usize - IMAGE_HEADER_SIZE;
        &self.data[start..start + section.size as usize]
    }
}

/// Read an image file back: check magic and version, reassemble the data
/// region (decompressing blocks if needed), and recompute the data+bitmap
/// checksum. Header-level structural problems surface as
/// [`ImageError::Consistency`].
pub fn validate_image_file(path: &Path) -> Result<ImageValidation, ImageError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    if bytes.len() < IMAGE_HEADER_SIZE {
        return Err(ImageError::Consistency(
            "image file shorter than its header".to_string(),
        ));
    }
    let header: ImageHeader = bytemuck::pod_read_unaligned(&bytes[..IMAGE_HEADER_SIZE]);
    if !header.is_valid() {
        return Err(ImageError::Consistency(
            "bad image magic or version".to_string(),
        ));
    }

    let data_len = header.image_size as usize - IMAGE_HEADER_SIZE;
    let (data, data_end) = if header.blocks_count == 0 {
        let end = IMAGE_HEADER_SIZE + data_len;
        if bytes.len() < end {
            return Err(ImageError::Consistency("truncated data region".to_string()));
        }
        (bytes[IMAGE_HEADER_SIZE..end].to_vec(), end)
    } else {
        let table_start = header.blocks_offset as usize;
        let block_size = std::mem::size_of::<ImageBlock>();
        let table_end = table_start + header.blocks_count as usize * block_size;
        if bytes.len() < table_end {
            return Err(ImageError::Consistency("truncated block table".to_string()));
        }
        let blocks: Vec<ImageBlock> = (0..header.blocks_count as usize)
            .map(|i| {
                let at = table_start + i * block_size;
                bytemuck::pod_read_unaligned(&bytes[at..at + block_size])
            })
            .collect();
        let mut data = vec![0u8; data_len];
        let mut end = table_end;
        for block in &blocks {
            let stored_start = block.data_offset as usize;
            let stored_end = stored_start + block.data_size as usize;
            if bytes.len() < stored_end {
                return Err(ImageError::Consistency("truncated block".to_string()));
            }
            let decompressed = lz4_flex::block::decompress(
                &bytes[stored_start..stored_end],
                block.image_size as usize,
            )
            .map_err(|e| ImageError::Consistency(format!("block decompression: {}", e)))?;
            let at = block.image_offset as usize - IMAGE_HEADER_SIZE;
            data[at..at + decompressed.len()].copy_from_slice(&decompressed);
            end = end.max(stored_end);
        }
        (data, end)
    };

    let bitmap_section = header.section(SectionKind::ImageBitmap);
    let bitmap_offset = raw_align_up(data_end, ELF_SEGMENT_ALIGNMENT);
    let bitmap_end = bitmap_offset + bitmap_section.size as usize;
    if bytes.len() < bitmap_end {
        return Err(ImageError::Consistency("truncated bitmap".to_string()));
    }
    let bitmap = bytes[bitmap_offset..bitmap_end].to_vec();

    let mut checksum = Adler32::new();
    checksum.update(&data);
    checksum.update(&bitmap);
    Ok(ImageValidation {
        header,
        data_checksum: checksum.value(),
        data,
        bitmap,
    })
}
