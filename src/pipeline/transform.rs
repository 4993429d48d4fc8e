use std::collections::BTreeSet;
use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use rand::Rng;

use super::job::{Conversion, TransformJob};
use super::record::Example;
use super::sample::{Sample, SampleValue};
use crate::error::{EtlError, EtlResult};

/// 按顺序执行 conversions，然后做一次 selection 过滤
pub fn transform_sample(job: &TransformJob, mut sample: Sample) -> EtlResult<Sample> {
    for conv in &job.conversions {
        apply(conv, &mut sample)?;
    }
    if !job.selects_all() {
        let keep: BTreeSet<&str> = job.selections.iter().map(|s| s.ext_name.as_str()).collect();
        sample.values.retain(|k, _| keep.contains(k.as_str()));
    }
    Ok(sample)
}

fn apply(conv: &Conversion, sample: &mut Sample) -> EtlResult<()> {
    match conv {
        Conversion::Decode { ext_name } => {
            let img = match sample.get(ext_name) {
                Some(SampleValue::Bytes(b)) => image::load_from_memory(b).map_err(|e| {
                    EtlError::bad_input(format!(
                        "sample {}: failed to decode {ext_name:?}: {e}",
                        sample.prefix
                    ))
                })?,
                other => return Err(wrong_value(sample, ext_name, "bytes", other)),
            };
            sample.insert(ext_name.clone(), SampleValue::Image(img));
        }
        Conversion::Rotate { ext_name, angle } => {
            let angle = if *angle == 0.0 {
                rand::thread_rng().gen_range(0.0..100.0)
            } else {
                *angle
            };
            let img = expect_image(sample, ext_name)?;
            let rotated = rotate(img, angle);
            sample.insert(ext_name.clone(), SampleValue::Image(rotated));
        }
        Conversion::Resize { ext_name, dst_size } => {
            let img = expect_image(sample, ext_name)?;
            let resized = img.resize_exact(dst_size[0], dst_size[1], FilterType::Triangle);
            sample.insert(ext_name.clone(), SampleValue::Image(resized));
        }
        Conversion::Rename { renames } => {
            for (dst, srcs) in renames {
                if let Some(src) = srcs.iter().find(|s| sample.contains(s)) {
                    if let Some(v) = sample.remove(src) {
                        sample.insert(dst.clone(), v);
                    }
                }
            }
        }
    }
    Ok(())
}

fn expect_image<'s>(sample: &'s Sample, key: &str) -> EtlResult<&'s DynamicImage> {
    match sample.get(key) {
        Some(SampleValue::Image(img)) => Ok(img),
        other => Err(wrong_value(sample, key, "decoded image", other)),
    }
}

fn wrong_value(sample: &Sample, key: &str, want: &str, got: Option<&SampleValue>) -> EtlError {
    match got {
        None => EtlError::bad_input(format!("sample {}: missing {key:?}", sample.prefix)),
        Some(v) => EtlError::bad_input(format!(
            "sample {}: {key:?} is {}, expected {want}",
            sample.prefix,
            v.kind()
        )),
    }
}

/// 逆时针旋转 `angle` 度，画布扩展到能容纳整幅图，未覆盖区域填黑色。
///
/// 90 的整数倍走精确路径，其它角度双线性采样。
pub fn rotate(img: &DynamicImage, angle: f64) -> DynamicImage {
    let angle = angle.rem_euclid(360.0);
    if angle == 0.0 {
        return img.clone();
    }
    if angle == 90.0 {
        return DynamicImage::ImageRgba8(imageops::rotate270(&img.to_rgba8()));
    }
    if angle == 180.0 {
        return DynamicImage::ImageRgba8(imageops::rotate180(&img.to_rgba8()));
    }
    if angle == 270.0 {
        return DynamicImage::ImageRgba8(imageops::rotate90(&img.to_rgba8()));
    }

    let src = img.to_rgba8();
    let (sw, sh) = (src.width() as f64, src.height() as f64);
    let (sin, cos) = angle.to_radians().sin_cos();
    let dw = (sw * cos.abs() + sh * sin.abs()).ceil().max(1.0);
    let dh = (sw * sin.abs() + sh * cos.abs()).ceil().max(1.0);

    let black = Rgba([0, 0, 0, 255]);
    let mut dst = RgbaImage::from_pixel(dw as u32, dh as u32, black);
    let (scx, scy) = (sw / 2.0, sh / 2.0);
    let (dcx, dcy) = (dw / 2.0, dh / 2.0);

    for (x, y, px) in dst.enumerate_pixels_mut() {
        // 目标像素中心逆映射回源图（y 轴向下，逆时针旋转在图像坐标系中为 -angle）
        let dx = x as f64 + 0.5 - dcx;
        let dy = y as f64 + 0.5 - dcy;
        let sx = dx * cos - dy * sin + scx - 0.5;
        let sy = dx * sin + dy * cos + scy - 0.5;
        if sx < -0.5 || sy < -0.5 || sx > sw - 0.5 || sy > sh - 0.5 {
            continue;
        }
        *px = bilinear(&src, sx, sy, black);
    }
    DynamicImage::ImageRgba8(dst)
}

fn bilinear(src: &RgbaImage, x: f64, y: f64, fill: Rgba<u8>) -> Rgba<u8> {
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let sample = |xi: f64, yi: f64| -> [f64; 4] {
        if xi < 0.0 || yi < 0.0 || xi >= src.width() as f64 || yi >= src.height() as f64 {
            return fill.0.map(|c| c as f64);
        }
        src.get_pixel(xi as u32, yi as u32).0.map(|c| c as f64)
    };
    let p00 = sample(x0, y0);
    let p10 = sample(x0 + 1.0, y0);
    let p01 = sample(x0, y0 + 1.0);
    let p11 = sample(x0 + 1.0, y0 + 1.0);
    let mut out = [0u8; 4];
    for i in 0..4 {
        let top = p00[i] * (1.0 - fx) + p10[i] * fx;
        let bottom = p01[i] * (1.0 - fx) + p11[i] * fx;
        out[i] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgba(out)
}

/// 样本 -> Example：图像编码为 PNG，原始字节原样写入，其它值 JSON 编码
pub fn sample_to_example(sample: Sample) -> EtlResult<Example> {
    let mut example = Example::new();
    for (key, value) in sample.values {
        let bytes = match value {
            SampleValue::Bytes(b) => b,
            SampleValue::Image(img) => {
                let mut buf = Cursor::new(Vec::new());
                img.write_to(&mut buf, ImageOutputFormat::Png).map_err(|e| {
                    EtlError::bad_input(format!(
                        "sample {}: failed to encode image {key:?}: {e}",
                        sample.prefix
                    ))
                })?;
                buf.into_inner()
            }
            SampleValue::Json(v) => serde_json::to_vec(&v).map_err(|e| {
                EtlError::bad_input(format!("sample {}: failed to encode {key:?}: {e}", sample.prefix))
            })?,
        };
        example.add_bytes(key, bytes);
    }
    Ok(example)
}
